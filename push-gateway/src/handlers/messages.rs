use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::trace;
use uuid::Uuid;

use crate::dispatch::PushGateway;
use crate::error::{GatewayError, Result};
use crate::models::{FailedMessage, ProviderKind};
use crate::store::Store;

#[derive(Debug, Deserialize)]
pub struct SendPayload {
    pub uuid: Uuid,
    pub msg: String,
    #[serde(default)]
    pub tag: String,
}

/// Push a message to a device
///
/// POST /send — `{uuid, msg, tag}`; answers with the new message uuid.
pub async fn send_push(
    gateway: web::Data<Arc<PushGateway>>,
    payload: web::Json<SendPayload>,
) -> Result<HttpResponse> {
    trace!("parsed uuid = {}, tag = '{}'", payload.uuid, payload.tag);

    let message = gateway
        .push(payload.uuid, &payload.msg, &payload.tag)
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "uuid": message,
    })))
}

/// Redeliver messages by uuid
///
/// POST /redeliver — body is a JSON array of message uuids. Each message is
/// re-read from the store and goes through the same claim protocol as the
/// periodic loop.
pub async fn redeliver(
    gateway: web::Data<Arc<PushGateway>>,
    store: web::Data<Arc<dyn Store>>,
    messages: web::Json<Vec<Uuid>>,
) -> Result<HttpResponse> {
    for message in messages.iter() {
        trace!("will try to redeliver {}", message);

        let record = store
            .get_message(*message)
            .await?
            .ok_or(GatewayError::UnknownMessage(*message))?;
        gateway
            .redeliver(record.message, record.device, record.kind)
            .await?;
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

fn failed_json(entries: &[FailedMessage]) -> Vec<serde_json::Value> {
    entries
        .iter()
        .map(|entry| {
            serde_json::json!({
                "uuid": entry.message,
                "device": entry.device,
                "msg": entry.reason,
            })
        })
        .collect()
}

/// GET /list — failed messages of every provider.
pub async fn list_failed(store: web::Data<Arc<dyn Store>>) -> Result<HttpResponse> {
    let entries = store.get_failed_messages_all().await?;
    Ok(HttpResponse::Ok().json(failed_json(&entries)))
}

/// GET /list_apns
pub async fn list_failed_apns(store: web::Data<Arc<dyn Store>>) -> Result<HttpResponse> {
    let entries = store.get_failed_messages(ProviderKind::Apns).await?;
    Ok(HttpResponse::Ok().json(failed_json(&entries)))
}

/// GET /list_gcm
pub async fn list_failed_gcm(store: web::Data<Arc<dyn Store>>) -> Result<HttpResponse> {
    let entries = store.get_failed_messages(ProviderKind::Gcm).await?;
    Ok(HttpResponse::Ok().json(failed_json(&entries)))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/send", web::post().to(send_push))
        .route("/redeliver", web::post().to(redeliver))
        .route("/list", web::get().to(list_failed))
        .route("/list_apns", web::get().to(list_failed_apns))
        .route("/list_gcm", web::get().to(list_failed_gcm));
}
