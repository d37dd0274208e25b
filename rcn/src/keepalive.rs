use crate::channel::ControlPlane;
use crate::cluster::ClusterController;
use crate::error::NodeError;
use common::KeepAliveRequest;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Timeout for the first report after a success.
pub const BASE_TIMEOUT: Duration = Duration::from_secs(15);
/// Doubling stops here.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);
/// This many failures inside [`FAILURE_WINDOW`] force a re-registration.
pub const FAILURE_LIMIT: usize = 5;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(10 * 60);
/// A forced re-registration that takes longer than this kills the process.
pub const RESTART_BOUND: Duration = Duration::from_secs(10 * 60);

/// Sliding count of recent keepalive failures.
#[derive(Debug, Default)]
pub struct FailureWindow {
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    /// Record a failure at `now` and return how many failures the window
    /// currently holds.
    pub fn record(&mut self, now: Instant) -> usize {
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > FAILURE_WINDOW {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);
        self.failures.len()
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }
}

/// Per-report deadline that doubles on failure and snaps back on success,
/// so a slow control plane gets more room without hiding a dead one.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    current: Duration,
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self {
            current: BASE_TIMEOUT,
        }
    }
}

impl AdaptiveTimeout {
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_failure(&mut self) {
        self.current = (self.current * 2).min(MAX_TIMEOUT);
    }

    pub fn on_success(&mut self) {
        self.current = BASE_TIMEOUT;
    }
}

enum TickOutcome {
    /// Acknowledged; counters may be drained.
    Success { server_time: i64 },
    /// The control plane dropped this node.
    Kicked,
    Failed(NodeError),
}

fn classify(result: Result<Option<i64>, NodeError>) -> TickOutcome {
    match result {
        Ok(Some(server_time)) => TickOutcome::Success { server_time },
        Ok(None) => TickOutcome::Kicked,
        Err(e) => TickOutcome::Failed(e),
    }
}

/// Periodic liveness reporting. Runs for the life of the process; only
/// reports while the node is enabled.
pub struct KeepAliveSupervisor {
    cluster: Arc<ClusterController>,
    control: Arc<dyn ControlPlane>,
}

impl KeepAliveSupervisor {
    pub fn new(cluster: Arc<ClusterController>, control: Arc<dyn ControlPlane>) -> Self {
        Self { cluster, control }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut window = FailureWindow::default();
            let mut timeout = AdaptiveTimeout::default();
            let mut ticker = time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so a fresh enable
            // gets a full interval of traffic before the first report
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !self.cluster.is_enabled() {
                    continue;
                }
                self.tick(&mut window, &mut timeout).await;
            }
        })
    }

    async fn tick(&self, window: &mut FailureWindow, timeout: &mut AdaptiveTimeout) {
        let snapshot = self.cluster.counters.snapshot();
        let sent_at = chrono::Utc::now().timestamp_millis();
        let request = KeepAliveRequest {
            time: sent_at,
            hits: snapshot.hits,
            bytes: snapshot.bytes,
        };

        match classify(self.control.keep_alive(request, timeout.current()).await) {
            TickOutcome::Success { server_time } => {
                self.cluster.counters.subtract(snapshot);
                timeout.on_success();
                window.clear();
                debug!(
                    "keepalive acknowledged, clock offset {}ms",
                    server_time - sent_at
                );
            }
            TickOutcome::Kicked => {
                self.force_restart("removed by control plane").await;
                window.clear();
                timeout.on_success();
            }
            TickOutcome::Failed(e) => {
                timeout.on_failure();
                let recent = window.record(Instant::now());
                warn!(
                    "keepalive failed ({recent}/{FAILURE_LIMIT} in window, \
                     next timeout {:?}): {e}",
                    timeout.current()
                );
                if recent >= FAILURE_LIMIT {
                    self.force_restart("keepalive failure window exceeded")
                        .await;
                    window.clear();
                    timeout.on_success();
                }
            }
        }
    }

    /// Re-registration with an upper bound; a node that can neither serve
    /// nor re-register is better off dead and supervised externally.
    async fn force_restart(&self, reason: &str) {
        match time::timeout(RESTART_BOUND, self.cluster.restart(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("re-registration failed: {e}");
                std::process::exit(1);
            }
            Err(_) => {
                error!("re-registration did not finish within {RESTART_BOUND:?}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_only_recent_failures() {
        let mut window = FailureWindow::default();
        let start = Instant::now();
        for i in 0..4 {
            assert_eq!(window.record(start + Duration::from_secs(i * 60)), (i + 1) as usize);
        }
        // the first failure ages out before this one lands
        let late = start + FAILURE_WINDOW + Duration::from_secs(1);
        assert_eq!(window.record(late), 4);
    }

    #[test]
    fn window_clear_resets_the_count() {
        let mut window = FailureWindow::default();
        let now = Instant::now();
        window.record(now);
        window.record(now);
        window.clear();
        assert_eq!(window.record(now), 1);
    }

    #[test]
    fn five_rapid_failures_hit_the_limit() {
        let mut window = FailureWindow::default();
        let now = Instant::now();
        let mut last = 0;
        for i in 0..FAILURE_LIMIT {
            last = window.record(now + Duration::from_secs(i as u64));
        }
        assert_eq!(last, FAILURE_LIMIT);
    }

    #[test]
    fn timeout_doubles_and_caps() {
        let mut timeout = AdaptiveTimeout::default();
        assert_eq!(timeout.current(), Duration::from_secs(15));
        timeout.on_failure();
        assert_eq!(timeout.current(), Duration::from_secs(30));
        timeout.on_failure();
        assert_eq!(timeout.current(), Duration::from_secs(60));
        timeout.on_failure();
        assert_eq!(timeout.current(), Duration::from_secs(120));
        timeout.on_failure();
        assert_eq!(timeout.current(), MAX_TIMEOUT);
    }

    #[test]
    fn timeout_resets_on_success() {
        let mut timeout = AdaptiveTimeout::default();
        timeout.on_failure();
        timeout.on_failure();
        timeout.on_success();
        assert_eq!(timeout.current(), BASE_TIMEOUT);
    }

    #[test]
    fn outcome_classification() {
        assert!(matches!(
            classify(Ok(Some(5))),
            TickOutcome::Success { server_time: 5 }
        ));
        assert!(matches!(classify(Ok(None)), TickOutcome::Kicked));
        assert!(matches!(
            classify(Err(NodeError::Keepalive("x".into()))),
            TickOutcome::Failed(_)
        ));
    }
}
