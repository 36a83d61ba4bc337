/// Provider clients
///
/// Both clients expose the same capability: `post` a prebuilt wire payload
/// with a caller-supplied correlation identifier. The outcome arrives
/// asynchronously as a [`Completion`] on the channel handed to the client
/// at construction; the clients never hold a reference to the dispatcher.
pub mod apns;
pub mod gcm;

pub use apns::{ApnsClient, ApnsEndpoints, ApnsFeedback, TlsApnsConnector};
pub use gcm::GcmClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::models::ProviderKind;

/// Outcome of one provider submission, correlated by identifier.
#[derive(Debug, Clone)]
pub struct Completion {
    pub kind: ProviderKind,
    pub ident: u32,
    /// `None` on success; the provider-reported reason otherwise.
    pub error: Option<String>,
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// Event from the APNS feedback channel.
#[derive(Debug, Clone)]
pub enum FeedbackEvent {
    /// The provider reported this device token as unsubscribed at `time`.
    Unsubscribed { token: Vec<u8>, time: DateTime<Utc> },
    /// The remote closed the feedback channel; the transport reconnects.
    Shutdown,
}

pub type FeedbackSender = mpsc::UnboundedSender<FeedbackEvent>;
pub type FeedbackReceiver = mpsc::UnboundedReceiver<FeedbackEvent>;

/// Common submission capability of the provider clients.
///
/// `token` is the stored device token field (base64 text for APNS, the
/// registration id for GCM). `post` only hands the work to the transport;
/// it must not block on provider I/O.
#[async_trait]
pub trait PushClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn post(&self, token: &str, payload: &str, expiry: u32, ident: u32);
}
