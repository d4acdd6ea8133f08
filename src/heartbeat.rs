use crate::registry::EndpointRegistry;
use log::{debug, info, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Ask every endpoint for a status report once per `period`
pub async fn run(registry: Arc<EndpointRegistry>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately
    ticker.tick().await;

    info!("💓 Heartbeat every {:?}", period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let handles = registry.handles();
                trace!("💓 Heartbeat to {} endpoints", handles.len());
                for handle in handles {
                    if !handle.heartbeat() {
                        debug!("{}: mailbox busy, skipping heartbeat", handle.id());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{self, EndpointEvent};

    #[tokio::test]
    async fn test_heartbeat_reaches_every_endpoint() {
        let registry = Arc::new(EndpointRegistry::new(3));
        let (_a, mut inbox_a) = registry.register_with(endpoint::channel).unwrap();
        let (_b, mut inbox_b) = registry.register_with(endpoint::channel).unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            registry.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        ));

        for inbox in [&mut inbox_a, &mut inbox_b] {
            let event = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
                .await
                .unwrap();
            assert!(matches!(event, Some(EndpointEvent::Heartbeat)));
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
