/// Test doubles shared by the integration tests: an in-memory `Store`
/// implementation mirroring the Redis key semantics, and a recording
/// provider client.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use push_gateway::error::{GatewayError, Result};
use push_gateway::models::{DeadDevice, FailedMessage, MessageRecord, ProviderKind};
use push_gateway::providers::PushClient;
use push_gateway::store::Store;

#[derive(Clone)]
struct DeviceEntry {
    kind: ProviderKind,
    token_field: String,
    token_b64: String,
    death_time: Option<DateTime<Utc>>,
}

struct MessageEntry {
    device: Uuid,
    kind: ProviderKind,
    payload: String,
    tag: String,
    timestamp: DateTime<Utc>,
    attempts: Option<u32>,
    reason: Option<String>,
}

#[derive(Default)]
struct State {
    devices: HashMap<Uuid, DeviceEntry>,
    tokens: HashMap<String, Uuid>,
    messages: HashMap<Uuid, MessageEntry>,
    failed: HashMap<ProviderKind, HashSet<Uuid>>,
    dead: HashSet<Uuid>,
}

/// In-memory store with the same contracts as the Redis adapter. Shared
/// between gateway instances in a test to model peers on one backing store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }

    fn register(&self, kind: ProviderKind, token_field: String, token_b64: String) -> Uuid {
        let device = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.tokens.insert(token_b64.clone(), device);
        state.devices.insert(
            device,
            DeviceEntry {
                kind,
                token_field,
                token_b64,
                death_time: None,
            },
        );
        device
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_apns_device(&self, token: &[u8]) -> Result<Uuid> {
        let token_b64 = BASE64.encode(token);
        Ok(self.register(ProviderKind::Apns, token_b64.clone(), token_b64))
    }

    async fn register_gcm_device(&self, token: &str) -> Result<Uuid> {
        let token_b64 = BASE64.encode(token.as_bytes());
        Ok(self.register(ProviderKind::Gcm, token.to_string(), token_b64))
    }

    async fn drop_device(&self, device: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.devices.remove(&device) {
            state.tokens.remove(&entry.token_b64);
        }
        Ok(())
    }

    async fn mark_device_dead(&self, device: Uuid, time: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dead.insert(device);
        if let Some(entry) = state.devices.get_mut(&device) {
            entry.death_time = Some(time);
        }
        Ok(())
    }

    async fn get_dead_devices(&self) -> Result<Vec<DeadDevice>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .dead
            .iter()
            .filter_map(|device| {
                let time = state.devices.get(device)?.death_time?;
                Some(DeadDevice {
                    device: *device,
                    time,
                })
            })
            .collect())
    }

    async fn get_device_kind(&self, device: Uuid) -> Result<Option<ProviderKind>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .get(&device)
            .map(|entry| entry.kind))
    }

    async fn get_device_token(&self, device: Uuid) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(&device)
            .map(|entry| entry.token_field.clone())
            .ok_or(GatewayError::UnknownDevice(device))
    }

    async fn find_device_by_token_b64(&self, token_b64: &str) -> Result<Option<Uuid>> {
        Ok(self.state.lock().unwrap().tokens.get(token_b64).copied())
    }

    async fn write_message(
        &self,
        device: Uuid,
        kind: ProviderKind,
        payload: &str,
        tag: &str,
    ) -> Result<Uuid> {
        let message = Uuid::new_v4();
        self.state.lock().unwrap().messages.insert(
            message,
            MessageEntry {
                device,
                kind,
                payload: payload.to_string(),
                tag: tag.to_string(),
                timestamp: Utc::now(),
                attempts: None,
                reason: None,
            },
        );
        Ok(message)
    }

    async fn get_message(&self, message: Uuid) -> Result<Option<MessageRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .messages
            .get(&message)
            .map(|entry| MessageRecord {
                message,
                device: entry.device,
                kind: entry.kind,
                tag: entry.tag.clone(),
                timestamp: entry.timestamp,
                attempts: entry.attempts.unwrap_or(1),
            }))
    }

    async fn get_message_payload(&self, message: Uuid) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(&message)
            .map(|entry| entry.payload.clone())
            .ok_or(GatewayError::UnknownMessage(message))
    }

    async fn mark_message_failed(&self, message: Uuid, reason: &str) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let (kind, attempts) = {
            let entry = state
                .messages
                .get_mut(&message)
                .ok_or(GatewayError::UnknownMessage(message))?;
            let attempts = entry.attempts.unwrap_or(0) + 1;
            entry.attempts = Some(attempts);
            entry.reason = Some(reason.to_string());
            (entry.kind, attempts)
        };
        state.failed.entry(kind).or_default().insert(message);
        Ok(attempts)
    }

    async fn remove_from_failed_set(&self, message: Uuid) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let kind = state
            .messages
            .get(&message)
            .ok_or(GatewayError::UnknownMessage(message))?
            .kind;
        Ok(state
            .failed
            .entry(kind)
            .or_default()
            .remove(&message))
    }

    async fn drop_message(&self, message: Uuid) -> Result<()> {
        self.state.lock().unwrap().messages.remove(&message);
        Ok(())
    }

    async fn get_failed_messages(&self, kind: ProviderKind) -> Result<Vec<FailedMessage>> {
        let state = self.state.lock().unwrap();
        let Some(members) = state.failed.get(&kind) else {
            return Ok(Vec::new());
        };
        Ok(members
            .iter()
            .filter_map(|message| {
                let entry = state.messages.get(message)?;
                Some(FailedMessage {
                    message: *message,
                    device: entry.device,
                    kind,
                    reason: entry.reason.clone().unwrap_or_default(),
                    attempts: entry.attempts.unwrap_or(1),
                })
            })
            .collect())
    }

    async fn get_failed_messages_all(&self) -> Result<Vec<FailedMessage>> {
        let mut result = self.get_failed_messages(ProviderKind::Apns).await?;
        result.extend(self.get_failed_messages(ProviderKind::Gcm).await?);
        Ok(result)
    }
}

/// Captured provider submission.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub token: String,
    pub payload: String,
    pub ident: u32,
}

/// Provider client that records every submission instead of doing I/O.
/// Tests feed the matching completions through the gateway directly.
pub struct FakeClient {
    kind: ProviderKind,
    posts: Mutex<Vec<PostRecord>>,
}

impl FakeClient {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            posts: Mutex::new(Vec::new()),
        })
    }

    pub fn posts(&self) -> Vec<PostRecord> {
        self.posts.lock().unwrap().clone()
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub fn last_ident(&self) -> Option<u32> {
        self.posts.lock().unwrap().last().map(|post| post.ident)
    }
}

#[async_trait]
impl PushClient for FakeClient {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn post(&self, token: &str, payload: &str, _expiry: u32, ident: u32) {
        self.posts.lock().unwrap().push(PostRecord {
            token: token.to_string(),
            payload: payload.to_string(),
            ident,
        });
    }
}
