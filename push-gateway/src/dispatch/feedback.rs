use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::gateway::PushGateway;
use crate::metrics;
use crate::providers::{FeedbackEvent, FeedbackReceiver};

/// Drive APNS feedback events into the gateway until the channel closes.
///
/// The consumer is stateless across transport reconnects; a shutdown event
/// is expected whenever the remote closes the channel.
pub fn spawn_feedback_consumer(
    gateway: Arc<PushGateway>,
    mut events: FeedbackReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                FeedbackEvent::Unsubscribed { token, time } => {
                    if let Err(e) = gateway.handle_feedback(&token, time).await {
                        error!("feedback handling failed: {}", e);
                    }
                }
                FeedbackEvent::Shutdown => {
                    warn!("feedback channel was shutdown by remote host");
                    metrics::observe_feedback_event("shutdown");
                }
            }
        }
        debug!("feedback channel closed");
    })
}
