// Application-level liveness probing for an open transport.

use chrono::Utc;
use draftline_core::protocol::ClientMessage;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::HeartbeatConfig;
use crate::connection::ConnectionStatus;
use crate::transport::Outbound;

/// Everything the monitor needs from the transport it watches.
pub struct HeartbeatLink {
    /// Generation of the transport, echoed back when it goes stale.
    pub generation: u64,
    pub draft_id: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub status: watch::Receiver<ConnectionStatus>,
    /// Time of the last inbound frame of any kind.
    pub last_ack: watch::Receiver<Instant>,
    pub stale: mpsc::UnboundedSender<u64>,
}

/// Sends a `ping` every interval while the connection is open and reports
/// the transport stale when nothing has been heard for the ack timeout.
///
/// Only ever started from the open transition. The task ends by itself as
/// soon as the status leaves `Open`, and is aborted when dropped.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start(config: HeartbeatConfig, link: HeartbeatLink) -> Self {
        Self {
            task: tokio::spawn(run(config, link)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        // Drop aborts.
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(config: HeartbeatConfig, mut link: HeartbeatLink) {
    let mut probe = tokio::time::interval(config.interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first probe goes out one
    // full interval after open.
    probe.tick().await;

    loop {
        let deadline = *link.last_ack.borrow() + config.ack_timeout;
        tokio::select! {
            _ = probe.tick() => {
                if *link.status.borrow() != ConnectionStatus::Open {
                    debug!("Heartbeat {} exiting; connection not open", link.generation);
                    return;
                }
                let ping = ClientMessage::Ping.encode(&link.draft_id, Utc::now().timestamp_millis());
                if link.outbound.send(Outbound::Text(ping)).await.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let silent_for = Instant::now().saturating_duration_since(*link.last_ack.borrow());
                if silent_for >= config.ack_timeout {
                    warn!(
                        "No frame on connection {} for {:?}; reporting it stale",
                        link.generation, silent_for
                    );
                    let _ = link.stale.send(link.generation);
                    return;
                }
            }
            changed = link.status.changed() => {
                if changed.is_err() || *link.status.borrow() != ConnectionStatus::Open {
                    debug!("Heartbeat {} exiting; connection not open", link.generation);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Rig {
        monitor: HeartbeatMonitor,
        outbound: mpsc::Receiver<Outbound>,
        status: watch::Sender<ConnectionStatus>,
        ack: watch::Sender<Instant>,
        stale: mpsc::UnboundedReceiver<u64>,
    }

    fn rig() -> Rig {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Open);
        let (ack_tx, ack_rx) = watch::channel(Instant::now());
        let (stale_tx, stale_rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start(
            HeartbeatConfig::default(),
            HeartbeatLink {
                generation: 7,
                draft_id: "d1".into(),
                outbound: out_tx,
                status: status_rx,
                last_ack: ack_rx,
                stale: stale_tx,
            },
        );
        Rig {
            monitor,
            outbound: out_rx,
            status: status_tx,
            ack: ack_tx,
            stale: stale_rx,
        }
    }

    fn assert_near(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn is_ping(item: &Outbound) -> bool {
        match item {
            Outbound::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text).unwrap();
                value["type"] == "ping" && value["timestamp"].is_i64()
            }
            Outbound::Close { .. } => false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probes_once_per_interval() {
        let mut rig = rig();
        let start = Instant::now();

        let first = rig.outbound.recv().await.unwrap();
        assert!(is_ping(&first));
        assert_near(start.elapsed(), Duration::from_secs(25));

        rig.ack.send_replace(Instant::now());
        let second = rig.outbound.recv().await.unwrap();
        assert!(is_ping(&second));
        assert_near(start.elapsed(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_ack_timeout_reports_stale() {
        let mut rig = rig();
        let start = Instant::now();

        assert_eq!(rig.stale.recv().await, Some(7));
        assert_near(start.elapsed(), Duration::from_secs(55));
        tokio::task::yield_now().await;
        assert!(rig.monitor.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn acks_keep_the_connection_fresh() {
        let mut rig = rig();
        for _ in 0..4 {
            rig.outbound.recv().await.unwrap();
            rig.ack.send_replace(Instant::now());
        }
        assert!(rig.stale.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_connection_leaves_open() {
        let mut rig = rig();
        rig.status.send_replace(ConnectionStatus::Closed);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(rig.monitor.is_finished());
        assert!(rig.outbound.recv().await.is_none());
    }
}
