//! Liveness monitor: periodic eviction of dead or silent peers.
//!
//! There is no keep-alive traffic: a peer that stays quiet longer than the
//! timeout is treated exactly like one that vanished.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::identity::PeerId;
use crate::peer::ConnectionRegistry;

pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// Evict peers whose connection is closed or that have been silent past
    /// the timeout as of `now`. Returns the evicted peer ids.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<PeerId> {
        let stale = self.registry.stale(now, self.timeout, |conn| conn.is_closed());
        let mut evicted = Vec::with_capacity(stale.len());

        for (peer_id, conn_id) in stale {
            if self
                .registry
                .disconnect(&peer_id, Some(conn_id), "inactive past liveness timeout")
                .await
            {
                evicted.push(peer_id);
            }
        }
        evicted
    }

    pub async fn sweep(&self) -> Vec<PeerId> {
        self.sweep_at(Utc::now()).await
    }

    /// Run the monitor in the background until `shutdown` fires.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep().await;
                    if evicted.is_empty() {
                        debug!("Liveness check: {} peers healthy", self.registry.len());
                    } else {
                        info!("Liveness check evicted {} peer(s)", evicted.len());
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Liveness monitor shutting down");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::peer::PeerInfo;
    use crate::transport::{Connection, MessageStream, accept, bind, dial};

    const WAIT: Duration = Duration::from_secs(5);

    async fn connection() -> (Arc<Connection>, MessageStream, Arc<Connection>, MessageStream) {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &NetworkConfig::local()).await.unwrap()
        });
        let (client, client_rx) = dial(&addr.to_string(), &NetworkConfig::local()).await.unwrap();
        let (server, server_rx) = server.await.unwrap();
        (client, client_rx, server, server_rx)
    }

    fn register(registry: &ConnectionRegistry, name: &str, conn: &Arc<Connection>) -> PeerId {
        let info = PeerInfo::new(PeerId::generate(), name, "127.0.0.1", 1);
        let id = info.peer_id.clone();
        registry.insert(info, conn.id(), Arc::clone(conn), 8).unwrap();
        id
    }

    #[tokio::test]
    async fn test_silent_peer_evicted_recent_peer_kept() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _a_rx, _a_remote, _a_remote_rx) = connection().await;
        let (b, _b_rx, _b_remote, _b_remote_rx) = connection().await;
        let quiet = register(&registry, "quiet", &a);
        let chatty = register(&registry, "chatty", &b);

        let monitor = LivenessMonitor::new(
            Arc::clone(&registry),
            Duration::from_millis(100),
            Duration::from_millis(150),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        registry.touch(&chatty, b.id());

        let evicted = monitor.sweep().await;
        assert_eq!(evicted, vec![quiet.clone()]);
        assert!(registry.contains(&chatty));
        assert!(!registry.contains(&quiet));
        assert!(a.is_closed());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_closed_connection_evicted_immediately() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _a_rx, _remote, _remote_rx) = connection().await;
        let id = register(&registry, "dead", &a);
        a.close().await;

        let monitor = LivenessMonitor::new(
            Arc::clone(&registry),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        assert_eq!(monitor.sweep().await, vec![id]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_races_with_reader_removal() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _a_rx, _remote, _remote_rx) = connection().await;
        let id = register(&registry, "racer", &a);

        let monitor = LivenessMonitor::new(
            Arc::clone(&registry),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let reader_side = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            let conn_id = a.id();
            tokio::spawn(async move { registry.disconnect(&id, Some(conn_id), "end of stream").await })
        };
        let evicted = monitor
            .sweep_at(Utc::now() + chrono::Duration::seconds(120))
            .await;
        let reader_won = reader_side.await.unwrap();

        assert_eq!(evicted.len() + usize::from(reader_won), 1);
        assert!(registry.is_empty());
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_background_monitor_ticks_and_stops() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _a_rx, _remote, _remote_rx) = connection().await;
        register(&registry, "short-lived", &a);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = LivenessMonitor::new(
            Arc::clone(&registry),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
        .spawn(shutdown_rx);

        tokio::time::timeout(WAIT, async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
