/// GCM client
///
/// Plain HTTPS request/response; the correlation identifier is purely a
/// client-side tag used to route the completion back to the dispatcher.
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Completion, CompletionSender, PushClient};
use crate::models::ProviderKind;

const GCM_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

pub struct GcmClient {
    project_id: String,
    api_key: String,
    http: reqwest::Client,
    completions: CompletionSender,
}

impl GcmClient {
    pub fn new(
        project_id: String,
        api_key: String,
        pool_size: usize,
        completions: CompletionSender,
    ) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_size.max(1))
            .build()?;
        debug!("gcm client initialized for project {}", project_id);
        Ok(Self {
            project_id,
            api_key,
            http,
            completions,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

#[async_trait]
impl PushClient for GcmClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcm
    }

    async fn post(&self, _token: &str, payload: &str, _expiry: u32, ident: u32) {
        let http = self.http.clone();
        let api_key = self.api_key.clone();
        let completions = self.completions.clone();
        let payload = payload.to_string();

        tokio::spawn(async move {
            let error = match http
                .post(GCM_SEND_URL)
                .header("Authorization", format!("key={api_key}"))
                .header("Content-Type", "application/json")
                .body(payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => None,
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "unknown error".to_string());
                    warn!("gcm delivery failed: {} - {}", status, body);
                    Some(format!("GCM API error: {status} - {body}"))
                }
                Err(e) => {
                    warn!("gcm send request failed: {}", e);
                    Some(format!("GCM send request failed: {e}"))
                }
            };
            let _ = completions.send(Completion {
                kind: ProviderKind::Gcm,
                ident,
                error,
            });
        });
    }
}
