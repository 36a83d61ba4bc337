use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Push provider kind
///
/// Persisted in the store as a small integer (APNS=0, GCM=1). Unknown
/// integers read back from the store are a corruption error, never coerced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderKind {
    /// Apple-style binary push protocol with a feedback channel
    Apns,
    /// Google-style HTTPS request/response protocol
    Gcm,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Apns, ProviderKind::Gcm];

    /// Integer encoding used in the store. Interoperates with peer instances.
    pub const fn as_int(self) -> i64 {
        match self {
            ProviderKind::Apns => 0,
            ProviderKind::Gcm => 1,
        }
    }

    /// Decode the stored integer. `None` for anything outside the encoding.
    pub fn from_int(value: i64) -> Option<Self> {
        match value {
            0 => Some(ProviderKind::Apns),
            1 => Some(ProviderKind::Gcm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Apns => "apns",
            ProviderKind::Gcm => "gcm",
        }
    }
}

/// A device marked unsubscribed by provider feedback but not yet dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadDevice {
    pub device: Uuid,
    pub time: DateTime<Utc>,
}

/// Persisted message record, as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message: Uuid,
    pub device: Uuid,
    pub kind: ProviderKind,
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    /// Reported as 1 when the record has no attempts field yet.
    pub attempts: u32,
}

/// Entry of a per-provider failed-message set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    pub message: Uuid,
    pub device: Uuid,
    pub kind: ProviderKind,
    pub reason: String,
    pub attempts: u32,
}
