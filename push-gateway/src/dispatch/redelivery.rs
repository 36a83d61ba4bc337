use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use super::gateway::PushGateway;

/// Periodic redelivery timer.
///
/// Fires every `interval` and runs one pass over the failed sets. The
/// shutdown signal stops the loop without rearming the timer; dropping the
/// handle is the shutdown.
pub struct RedeliveryLoop {
    shutdown_tx: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl RedeliveryLoop {
    pub fn spawn(gateway: Arc<PushGateway>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            redelivery_loop(gateway, interval, shutdown_rx).await;
        });

        Self {
            shutdown_tx,
            handle,
        }
    }
}

impl Drop for RedeliveryLoop {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}

async fn redelivery_loop(
    gateway: Arc<PushGateway>,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("redelivery timer aborted");
                break;
            }
            _ = sleep(interval) => {
                trace!("redelivery timer fired, checking redelivery");
                gateway.run_redelivery_pass().await;
            }
        }
    }
}
