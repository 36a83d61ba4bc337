/// Dispatch engine
///
/// Turns a logical "push this message to this device" request into provider
/// I/O, correlates provider completions back to the originating message,
/// persists attempt state and arbitrates retire/retry races with peer
/// instances through the store's failed-set claim.
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::correlation::CorrelationTable;
use crate::config::AutomationConfig;
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::models::ProviderKind;
use crate::providers::{Completion, CompletionReceiver, PushClient};
use crate::store::Store;

pub struct PushGateway {
    store: Arc<dyn Store>,
    apns: Option<Arc<dyn PushClient>>,
    gcm: Option<Arc<dyn PushClient>>,
    apns_idents: CorrelationTable,
    gcm_idents: CorrelationTable,
    automation: AutomationConfig,
}

impl PushGateway {
    pub fn new(
        store: Arc<dyn Store>,
        apns: Option<Arc<dyn PushClient>>,
        gcm: Option<Arc<dyn PushClient>>,
        automation: AutomationConfig,
    ) -> Self {
        Self {
            store,
            apns,
            gcm,
            apns_idents: CorrelationTable::new(),
            gcm_idents: CorrelationTable::new(),
            automation,
        }
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.client(kind).is_some()
    }

    fn client(&self, kind: ProviderKind) -> Option<&Arc<dyn PushClient>> {
        match kind {
            ProviderKind::Apns => self.apns.as_ref(),
            ProviderKind::Gcm => self.gcm.as_ref(),
        }
    }

    fn idents(&self, kind: ProviderKind) -> &CorrelationTable {
        match kind {
            ProviderKind::Apns => &self.apns_idents,
            ProviderKind::Gcm => &self.gcm_idents,
        }
    }

    fn stat(&self, kind: ProviderKind, event: &'static str, message: Uuid, detail: &str) {
        info!(
            target: "stats",
            provider = kind.as_str(),
            event,
            message = %message,
            "{}", detail
        );
        metrics::observe_message_outcome(kind, event);
    }

    /// Persist a new message record for `device` and submit it. Returns the
    /// message uuid synchronously; the delivery outcome arrives through the
    /// completion channel.
    pub async fn push(&self, device: Uuid, message: &str, tag: &str) -> Result<Uuid> {
        info!("pushing message to device {}", device);

        let kind = self
            .store
            .get_device_kind(device)
            .await?
            .ok_or(GatewayError::UnknownDevice(device))?;
        let client = self
            .client(kind)
            .ok_or(GatewayError::ProviderNotConfigured(kind))?
            .clone();
        debug!("{} device detected", kind.as_str());

        let token = self.store.get_device_token(device).await?;
        let payload = build_payload(kind, message, &token);
        let message_uuid = self.store.write_message(device, kind, &payload, tag).await?;

        // The mapping must be visible before the submission that completes it.
        let ident = self.idents(kind).assign(message_uuid);
        client.post(&token, &payload, 0, ident).await;

        Ok(message_uuid)
    }

    /// Claim `message` from the failed set and resubmit it. A lost claim
    /// means another peer has taken the message and is not an error.
    pub async fn redeliver(
        &self,
        message: Uuid,
        device: Uuid,
        kind: ProviderKind,
    ) -> Result<()> {
        let client = self
            .client(kind)
            .ok_or(GatewayError::ProviderNotConfigured(kind))?
            .clone();

        if !self.store.remove_from_failed_set(message).await? {
            trace!(
                "message {} was already taken for redelivery by another peer",
                message
            );
            return Ok(());
        }

        debug!("redelivering {} message {}", kind.as_str(), message);

        // The persisted payload is authoritative.
        let token = self.store.get_device_token(device).await?;
        let payload = self.store.get_message_payload(message).await?;

        let ident = self.idents(kind).assign(message);
        client.post(&token, &payload, 0, ident).await;

        Ok(())
    }

    /// Process one provider completion.
    pub async fn handle_completion(&self, completion: Completion) -> Result<()> {
        let Completion { kind, ident, error } = completion;

        let Some(message) = self.idents(kind).take(ident) else {
            // Either the identifier was never registered or the provider
            // answered twice. Do not guess; refuse to touch any state.
            error!(
                "{} completion for unregistered identifier {}; dropping it",
                kind.as_str(),
                ident
            );
            return Err(GatewayError::CorrelationViolation { kind, ident });
        };

        match error {
            None => {
                info!(
                    "message {} is sent successfully thru {}",
                    message,
                    kind.as_str()
                );
                self.store.drop_message(message).await?;
                self.stat(kind, "sent", message, "sent successfully");
            }
            Some(reason) => {
                warn!(
                    "{} error for message {}: {}",
                    kind.as_str(),
                    message,
                    reason
                );
                let attempts = self.store.mark_message_failed(message, &reason).await?;
                if self.automation.auto_redeliver
                    && attempts >= self.automation.redeliver_attempts
                {
                    info!(
                        "message {} exceeded redelivery attempts, removing it completely",
                        message
                    );
                    if self.store.remove_from_failed_set(message).await? {
                        // No other peer beat us to it.
                        self.store.drop_message(message).await?;
                        self.stat(
                            kind,
                            "permanent_failure",
                            message,
                            &format!("permanently failed. reason: {reason}"),
                        );
                    }
                } else {
                    self.stat(
                        kind,
                        "redeliverable_failure",
                        message,
                        &format!("failed. will try to redeliver. reason: {reason}"),
                    );
                }
            }
        }

        Ok(())
    }

    /// Process one APNS feedback event.
    pub async fn handle_feedback(&self, token: &[u8], time: DateTime<Utc>) -> Result<()> {
        trace!("feedback time: {} for token of {} bytes", time, token.len());

        let token_b64 = BASE64.encode(token);
        let Some(device) = self.store.find_device_by_token_b64(&token_b64).await? else {
            debug!("feedback for unknown token {}", token_b64);
            metrics::observe_feedback_event("unknown_token");
            return Ok(());
        };

        info!(
            target: "stats",
            event = "device_unsubscribed",
            device = %device,
            time = %time,
            "device reported as unsubscribed"
        );
        metrics::observe_feedback_event("unsubscribed");

        if self.automation.auto_deregister {
            self.store.drop_device(device).await?;
            info!(
                target: "stats",
                event = "device_dropped",
                device = %device,
                "device automatically dropped"
            );
            metrics::observe_feedback_event("dropped");
        } else {
            self.store.mark_device_dead(device, time).await?;
            info!(
                target: "stats",
                event = "device_marked_dead",
                device = %device,
                "device marked as dead"
            );
            metrics::observe_feedback_event("marked_dead");
        }

        Ok(())
    }

    /// One redelivery pass over the failed sets of the configured providers.
    /// Store failures are logged; the next pass will retry.
    pub async fn run_redelivery_pass(&self) {
        for kind in ProviderKind::ALL {
            if !self.is_configured(kind) {
                continue;
            }
            let failed = match self.store.get_failed_messages(kind).await {
                Ok(failed) => failed,
                Err(e) => {
                    warn!(
                        "failed to list {} redelivery candidates: {}",
                        kind.as_str(),
                        e
                    );
                    continue;
                }
            };
            for entry in failed {
                trace!("{} message to redeliver: {}", kind.as_str(), entry.message);
                if let Err(e) = self.redeliver(entry.message, entry.device, kind).await {
                    warn!("redelivery of {} failed: {}", entry.message, e);
                }
            }
        }
    }
}

/// Provider wire payload for a logical message.
fn build_payload(kind: ProviderKind, message: &str, token: &str) -> String {
    match kind {
        ProviderKind::Apns => serde_json::json!({ "aps": { "alert": message } }).to_string(),
        ProviderKind::Gcm => serde_json::json!({
            "msg": message,
            "registration_ids": [token],
        })
        .to_string(),
    }
}

/// Drive provider completions into the gateway until the channel closes.
pub fn spawn_completion_loop(
    gateway: Arc<PushGateway>,
    mut completions: CompletionReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(completion) = completions.recv().await {
            if let Err(e) = gateway.handle_completion(completion).await {
                error!("completion handling failed: {}", e);
            }
        }
        debug!("completion channel closed");
    })
}
