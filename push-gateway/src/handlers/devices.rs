use std::sync::Arc;

use actix_web::{web, HttpResponse};
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::store::Store;

/// Register an APNS device
///
/// POST /device/register/apns — body is the raw device token bytes.
pub async fn register_apns(
    store: web::Data<Arc<dyn Store>>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    if body.is_empty() {
        return Err(GatewayError::InvalidPayload("empty device token".into()));
    }

    let device = store.register_apns_device(&body).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "uuid": device,
    })))
}

/// Register a GCM device
///
/// POST /device/register/gcm — body is the registration id string.
pub async fn register_gcm(
    store: web::Data<Arc<dyn Store>>,
    body: String,
) -> Result<HttpResponse> {
    if body.is_empty() {
        return Err(GatewayError::InvalidPayload("empty registration id".into()));
    }

    let device = store.register_gcm_device(&body).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "uuid": device,
    })))
}

/// Remove devices
///
/// POST /device/remove — body is a JSON array of device uuids.
pub async fn remove_devices(
    store: web::Data<Arc<dyn Store>>,
    devices: web::Json<Vec<Uuid>>,
) -> Result<HttpResponse> {
    debug!("parsed {} uuids of devices to remove", devices.len());

    for device in devices.iter() {
        store.drop_device(*device).await?;
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

/// List devices reported unsubscribed but kept in the store
///
/// GET /leavers
pub async fn list_leavers(store: web::Data<Arc<dyn Store>>) -> Result<HttpResponse> {
    let dead = store.get_dead_devices().await?;
    let entries: Vec<_> = dead
        .iter()
        .map(|entry| {
            serde_json::json!({
                "uuid": entry.device,
                "timestamp": entry.time.to_rfc3339(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(entries))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/device/register/apns", web::post().to(register_apns))
        .route("/device/register/gcm", web::post().to(register_gcm))
        .route("/device/remove", web::post().to(remove_devices))
        .route("/leavers", web::get().to(list_leavers));
}
