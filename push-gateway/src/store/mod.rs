/// Store adapter
///
/// Typed operations over the shared Redis key/value store for devices,
/// messages, the per-provider failed-message sets and the dead-device set.
/// Peer gateway instances interoperate through this key layout, so every
/// write here is wire format. The adapter carries no business logic; the
/// dispatch layer decides what to do with the answers.
use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use redis::Script;
use redis_utils::{with_timeout, SharedConnectionManager};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::models::{DeadDevice, FailedMessage, MessageRecord, ProviderKind};

const DEAD_DEVICES_KEY: &str = "dead_devices";

/// Timestamps are persisted as ISO text with microsecond precision, UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn device_key(device: Uuid) -> String {
    format!("device.{device}")
}

fn token_key(token_b64: &str) -> String {
    format!("device_token.{token_b64}")
}

fn message_key(message: Uuid) -> String {
    format!("message.{message}")
}

fn failed_set_key(kind: ProviderKind) -> String {
    format!("failed_messages.{}", kind.as_str())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| GatewayError::StoreCorruption(format!("bad timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| GatewayError::StoreCorruption(format!("bad uuid '{raw}': {e}")))
}

/// Decode a stored provider-kind integer, refusing anything outside the
/// known encoding.
fn parse_kind(raw: &str) -> Result<ProviderKind> {
    let value: i64 = raw.parse().map_err(|_| {
        GatewayError::StoreCorruption(format!("provider kind is not an integer: '{raw}'"))
    })?;
    ProviderKind::from_int(value).ok_or_else(|| {
        GatewayError::StoreCorruption(format!("unsupported provider kind integer {value}"))
    })
}

/// Reverse-index key suffix for a stored token field. APNS tokens are
/// already stored base64; GCM registration ids are encoded here.
fn reverse_suffix(kind: ProviderKind, token_field: &str) -> String {
    match kind {
        ProviderKind::Apns => token_field.to_string(),
        ProviderKind::Gcm => BASE64.encode(token_field.as_bytes()),
    }
}

/// Typed store operations shared by the dispatch layer, the control API
/// and the integration tests (which run against an in-memory impl).
#[async_trait]
pub trait Store: Send + Sync {
    async fn register_apns_device(&self, token: &[u8]) -> Result<Uuid>;
    async fn register_gcm_device(&self, token: &str) -> Result<Uuid>;
    /// Remove the device record and its reverse index. Idempotent.
    async fn drop_device(&self, device: Uuid) -> Result<()>;
    async fn mark_device_dead(&self, device: Uuid, time: DateTime<Utc>) -> Result<()>;
    async fn get_dead_devices(&self) -> Result<Vec<DeadDevice>>;
    /// `None` when the device is unknown.
    async fn get_device_kind(&self, device: Uuid) -> Result<Option<ProviderKind>>;
    /// The stored token field: base64 text for APNS, registration id for GCM.
    async fn get_device_token(&self, device: Uuid) -> Result<String>;
    async fn find_device_by_token_b64(&self, token_b64: &str) -> Result<Option<Uuid>>;
    async fn write_message(
        &self,
        device: Uuid,
        kind: ProviderKind,
        payload: &str,
        tag: &str,
    ) -> Result<Uuid>;
    async fn get_message(&self, message: Uuid) -> Result<Option<MessageRecord>>;
    async fn get_message_payload(&self, message: Uuid) -> Result<String>;
    /// Record the failure reason, add to the failed set for the message's
    /// kind and return the incremented attempts counter.
    async fn mark_message_failed(&self, message: Uuid, reason: &str) -> Result<u32>;
    /// The returned flag is the cross-process claim: exactly one caller
    /// racing on a message observes `true`.
    async fn remove_from_failed_set(&self, message: Uuid) -> Result<bool>;
    async fn drop_message(&self, message: Uuid) -> Result<()>;
    async fn get_failed_messages(&self, kind: ProviderKind) -> Result<Vec<FailedMessage>>;
    async fn get_failed_messages_all(&self) -> Result<Vec<FailedMessage>>;
}

/// Redis lacks a multi-key atomic delete, so device drops go through a
/// server-side script: the record and its reverse index vanish together
/// or not at all.
static DROP_DEVICE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"redis.call('DEL', KEYS[1])
redis.call('DEL', KEYS[2])
return 1",
    )
});

/// Redis-backed store implementation.
pub struct RedisStore {
    manager: SharedConnectionManager,
}

impl RedisStore {
    pub fn new(manager: SharedConnectionManager) -> Self {
        Self { manager }
    }

    async fn register_device(
        &self,
        kind: ProviderKind,
        token_field: &str,
        token_b64: &str,
    ) -> Result<Uuid> {
        let device = Uuid::new_v4();
        trace!("registering {} device as {}", kind.as_str(), device);

        let mut conn = self.manager.lock().await;
        with_timeout(
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(device_key(device))
                .arg("type")
                .arg(kind.as_int())
                .arg("token")
                .arg(token_field)
                .ignore()
                .cmd("SET")
                .arg(token_key(token_b64))
                .arg(device.to_string())
                .ignore()
                .query_async::<_, ()>(&mut *conn),
        )
        .await?;

        Ok(device)
    }

    /// Kind of a message record, required by set-affecting operations.
    async fn message_kind(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        message: Uuid,
    ) -> Result<ProviderKind> {
        let raw: Option<String> = with_timeout(
            redis::cmd("HGET")
                .arg(message_key(message))
                .arg("type")
                .query_async(conn),
        )
        .await?;
        let raw = raw.ok_or(GatewayError::UnknownMessage(message))?;
        parse_kind(&raw)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn register_apns_device(&self, token: &[u8]) -> Result<Uuid> {
        debug!("registering apns device");
        let token_b64 = BASE64.encode(token);
        self.register_device(ProviderKind::Apns, &token_b64, &token_b64)
            .await
    }

    async fn register_gcm_device(&self, token: &str) -> Result<Uuid> {
        debug!("registering gcm device");
        let token_b64 = BASE64.encode(token.as_bytes());
        self.register_device(ProviderKind::Gcm, token, &token_b64)
            .await
    }

    async fn drop_device(&self, device: Uuid) -> Result<()> {
        debug!("dropping device {}", device);

        let mut conn = self.manager.lock().await;
        let (kind_raw, token_field): (Option<String>, Option<String>) = with_timeout(
            redis::cmd("HMGET")
                .arg(device_key(device))
                .arg("type")
                .arg("token")
                .query_async(&mut *conn),
        )
        .await?;

        match token_field {
            Some(token_field) => {
                let kind = parse_kind(&kind_raw.ok_or_else(|| {
                    GatewayError::StoreCorruption(format!("device {device} has no kind"))
                })?)?;
                let suffix = reverse_suffix(kind, &token_field);
                with_timeout(
                    DROP_DEVICE_SCRIPT
                        .key(device_key(device))
                        .key(token_key(&suffix))
                        .invoke_async::<_, i64>(&mut *conn),
                )
                .await?;
            }
            // Already gone; the reverse index cannot be resolved and has
            // been deleted with the record.
            None => {
                with_timeout(
                    redis::cmd("DEL")
                        .arg(device_key(device))
                        .query_async::<_, i64>(&mut *conn),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn mark_device_dead(&self, device: Uuid, time: DateTime<Utc>) -> Result<()> {
        debug!("marking device {} as dead", device);

        let mut conn = self.manager.lock().await;
        with_timeout(
            redis::pipe()
                .atomic()
                .cmd("SADD")
                .arg(DEAD_DEVICES_KEY)
                .arg(device.to_string())
                .ignore()
                .cmd("HSET")
                .arg(device_key(device))
                .arg("death_time")
                .arg(format_timestamp(time))
                .ignore()
                .query_async::<_, ()>(&mut *conn),
        )
        .await?;

        Ok(())
    }

    async fn get_dead_devices(&self) -> Result<Vec<DeadDevice>> {
        let mut conn = self.manager.lock().await;
        let members: Vec<String> = with_timeout(
            redis::cmd("SMEMBERS")
                .arg(DEAD_DEVICES_KEY)
                .query_async(&mut *conn),
        )
        .await?;

        let mut result = Vec::with_capacity(members.len());
        for member in members {
            let device = parse_uuid(&member)?;
            let death_time: Option<String> = with_timeout(
                redis::cmd("HGET")
                    .arg(device_key(device))
                    .arg("death_time")
                    .query_async(&mut *conn),
            )
            .await?;
            match death_time {
                Some(raw) => result.push(DeadDevice {
                    device,
                    time: parse_timestamp(&raw)?,
                }),
                None => {
                    // Device dropped after it was marked; stale set member.
                    warn!("dead device {} has no record, skipping", device);
                }
            }
        }

        Ok(result)
    }

    async fn get_device_kind(&self, device: Uuid) -> Result<Option<ProviderKind>> {
        let mut conn = self.manager.lock().await;
        let raw: Option<String> = with_timeout(
            redis::cmd("HGET")
                .arg(device_key(device))
                .arg("type")
                .query_async(&mut *conn),
        )
        .await?;

        match raw {
            Some(raw) => Ok(Some(parse_kind(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_device_token(&self, device: Uuid) -> Result<String> {
        let mut conn = self.manager.lock().await;
        let token: Option<String> = with_timeout(
            redis::cmd("HGET")
                .arg(device_key(device))
                .arg("token")
                .query_async(&mut *conn),
        )
        .await?;
        token.ok_or(GatewayError::UnknownDevice(device))
    }

    async fn find_device_by_token_b64(&self, token_b64: &str) -> Result<Option<Uuid>> {
        trace!("looking up device by token (base64): {}", token_b64);

        let mut conn = self.manager.lock().await;
        let raw: Option<String> = with_timeout(
            redis::cmd("GET")
                .arg(token_key(token_b64))
                .query_async(&mut *conn),
        )
        .await?;

        raw.map(|s| parse_uuid(&s)).transpose()
    }

    async fn write_message(
        &self,
        device: Uuid,
        kind: ProviderKind,
        payload: &str,
        tag: &str,
    ) -> Result<Uuid> {
        let message = Uuid::new_v4();
        trace!("writing new push message record {}", message);

        let mut conn = self.manager.lock().await;
        with_timeout(
            redis::cmd("HSET")
                .arg(message_key(message))
                .arg("payload")
                .arg(payload)
                .arg("type")
                .arg(kind.as_int())
                .arg("device")
                .arg(device.to_string())
                .arg("timestamp")
                .arg(format_timestamp(Utc::now()))
                .arg("tag")
                .arg(tag)
                .query_async::<_, ()>(&mut *conn),
        )
        .await?;

        Ok(message)
    }

    async fn get_message(&self, message: Uuid) -> Result<Option<MessageRecord>> {
        let mut conn = self.manager.lock().await;
        let fields: HashMap<String, String> = with_timeout(
            redis::cmd("HGETALL")
                .arg(message_key(message))
                .query_async(&mut *conn),
        )
        .await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let device = parse_uuid(fields.get("device").ok_or_else(|| {
            GatewayError::StoreCorruption(format!("message {message} has no device"))
        })?)?;
        let kind = parse_kind(fields.get("type").ok_or_else(|| {
            GatewayError::StoreCorruption(format!("message {message} has no kind"))
        })?)?;
        let timestamp = parse_timestamp(fields.get("timestamp").ok_or_else(|| {
            GatewayError::StoreCorruption(format!("message {message} has no timestamp"))
        })?)?;
        let attempts = match fields.get("attempts") {
            Some(raw) => raw.parse().map_err(|_| {
                GatewayError::StoreCorruption(format!("bad attempts counter '{raw}'"))
            })?,
            None => 1,
        };

        Ok(Some(MessageRecord {
            message,
            device,
            kind,
            tag: fields.get("tag").cloned().unwrap_or_default(),
            timestamp,
            attempts,
        }))
    }

    async fn get_message_payload(&self, message: Uuid) -> Result<String> {
        let mut conn = self.manager.lock().await;
        let payload: Option<String> = with_timeout(
            redis::cmd("HGET")
                .arg(message_key(message))
                .arg("payload")
                .query_async(&mut *conn),
        )
        .await?;
        payload.ok_or(GatewayError::UnknownMessage(message))
    }

    async fn mark_message_failed(&self, message: Uuid, reason: &str) -> Result<u32> {
        debug!("marking push message {} as failed", message);

        let mut conn = self.manager.lock().await;
        let kind = self.message_kind(&mut conn, message).await?;

        let (attempts,): (i64,) = with_timeout(
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(message_key(message))
                .arg("reason")
                .arg(reason)
                .ignore()
                .cmd("SADD")
                .arg(failed_set_key(kind))
                .arg(message.to_string())
                .ignore()
                .cmd("HINCRBY")
                .arg(message_key(message))
                .arg("attempts")
                .arg(1)
                .query_async(&mut *conn),
        )
        .await?;

        Ok(attempts as u32)
    }

    async fn remove_from_failed_set(&self, message: Uuid) -> Result<bool> {
        debug!("removing message {} from failed set", message);

        let mut conn = self.manager.lock().await;
        let kind = self.message_kind(&mut conn, message).await?;

        let removed: i64 = with_timeout(
            redis::cmd("SREM")
                .arg(failed_set_key(kind))
                .arg(message.to_string())
                .query_async(&mut *conn),
        )
        .await?;

        Ok(removed > 0)
    }

    async fn drop_message(&self, message: Uuid) -> Result<()> {
        debug!("dropping push message record {}", message);

        let mut conn = self.manager.lock().await;
        with_timeout(
            redis::cmd("DEL")
                .arg(message_key(message))
                .query_async::<_, i64>(&mut *conn),
        )
        .await?;

        Ok(())
    }

    async fn get_failed_messages(&self, kind: ProviderKind) -> Result<Vec<FailedMessage>> {
        trace!("listing failed messages for {}", kind.as_str());

        let mut conn = self.manager.lock().await;
        let members: Vec<String> = with_timeout(
            redis::cmd("SMEMBERS")
                .arg(failed_set_key(kind))
                .query_async(&mut *conn),
        )
        .await?;

        let mut result = Vec::with_capacity(members.len());
        for member in members {
            let message = parse_uuid(&member)?;
            let (device, reason, attempts): (Option<String>, Option<String>, Option<String>) =
                with_timeout(
                    redis::cmd("HMGET")
                        .arg(message_key(message))
                        .arg("device")
                        .arg("reason")
                        .arg("attempts")
                        .query_async(&mut *conn),
                )
                .await?;
            let Some(device) = device else {
                // Record retired by a peer between SMEMBERS and here.
                debug!("failed message {} has no record, skipping", message);
                continue;
            };
            result.push(FailedMessage {
                message,
                device: parse_uuid(&device)?,
                kind,
                reason: reason.unwrap_or_default(),
                attempts: attempts.and_then(|a| a.parse().ok()).unwrap_or(1),
            });
        }

        Ok(result)
    }

    async fn get_failed_messages_all(&self) -> Result<Vec<FailedMessage>> {
        let mut result = self.get_failed_messages(ProviderKind::Apns).await?;
        result.extend(self.get_failed_messages(ProviderKind::Gcm).await?);
        Ok(result)
    }
}
