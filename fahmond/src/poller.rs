//! Periodic retrieve of every client in the fleet.

use crate::client::{Connector, RetrieveOutcome, RetrieveStatus};
use crate::fleet::ClientFleet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

/// Default time between fleet retrieves.
pub const DEFAULT_RETRIEVE_INTERVAL: Duration = Duration::from_secs(60);

/// Counts from one pass over the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub succeeded: usize,
    pub waiting: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl PassSummary {
    fn from_outcomes(outcomes: &[(String, RetrieveOutcome)]) -> Self {
        let mut summary = Self::default();
        for (_, outcome) in outcomes {
            match outcome {
                RetrieveOutcome::Executed(RetrieveStatus::Success) => summary.succeeded += 1,
                RetrieveOutcome::Executed(RetrieveStatus::Waiting) => summary.waiting += 1,
                RetrieveOutcome::Executed(_) => summary.failed += 1,
                RetrieveOutcome::Dropped => summary.dropped += 1,
            }
        }
        summary
    }
}

/// Drives [`ClientFleet::retrieve_all`] on a fixed interval.
pub struct RetrievePoller<C: Connector> {
    fleet: Arc<ClientFleet<C>>,
    period: Duration,
    stop_tx: watch::Sender<bool>,
}

impl<C: Connector> RetrievePoller<C> {
    pub fn new(fleet: Arc<ClientFleet<C>>, period: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            fleet,
            period: period.max(Duration::from_millis(10)),
            stop_tx,
        }
    }

    /// One retrieve of every client.
    pub async fn poll_once(&self) -> PassSummary {
        run_pass(&self.fleet).await
    }

    /// Start the background loop. The first pass runs immediately.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let fleet = Arc::clone(&self.fleet);
        let period = self.period;
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "retrieve poller started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
                run_pass(&fleet).await;
            }
            info!("retrieve poller stopped");
        })
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// Retrieve every client, then persist benchmarks recorded during the pass.
async fn run_pass<C: Connector>(fleet: &ClientFleet<C>) -> PassSummary {
    let outcomes = fleet.retrieve_all().await;
    fleet.services().flush_benchmarks().await;
    let summary = PassSummary::from_outcomes(&outcomes);
    debug!(
        clients = outcomes.len(),
        succeeded = summary.succeeded,
        waiting = summary.waiting,
        failed = summary.failed,
        dropped = summary.dropped,
        "retrieve pass finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientServices;
    use crate::client::testing::{ScriptedConnector, burst, settings};
    use crate::events::FleetEvent;
    use fahmon_common::{ProteinBenchmarkIdentifier, SlotIdentifier};
    use fahmon_telemetry::{ProteinBenchmark, ProteinBenchmarkService};

    #[test]
    fn test_summary_counts_outcomes() {
        let outcomes = vec![
            ("a".to_string(), RetrieveOutcome::Executed(RetrieveStatus::Success)),
            ("b".to_string(), RetrieveOutcome::Executed(RetrieveStatus::ConnectFailed)),
            ("c".to_string(), RetrieveOutcome::Executed(RetrieveStatus::Waiting)),
            ("d".to_string(), RetrieveOutcome::Dropped),
        ];
        let summary = PassSummary::from_outcomes(&outcomes);
        assert_eq!(
            summary,
            PassSummary {
                succeeded: 1,
                waiting: 1,
                failed: 1,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_poll_once_with_failing_clients() {
        let fleet = Arc::new(ClientFleet::new(
            ScriptedConnector::failing(),
            ClientServices::in_memory(),
        ));
        fleet.add(settings("a")).await.unwrap();
        fleet.add(settings("b")).await.unwrap();
        let poller = RetrievePoller::new(fleet, Duration::from_secs(60));
        assert_eq!(poller.poll_once().await.failed, 2);
    }

    #[tokio::test]
    async fn test_pass_persists_changed_benchmarks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmarks.json");
        let mut services = ClientServices::in_memory();
        services.benchmarks = Arc::new(ProteinBenchmarkService::new().with_persistence(path.clone()));
        let fleet = Arc::new(ClientFleet::new(ScriptedConnector::failing(), services));
        let poller = RetrievePoller::new(Arc::clone(&fleet), Duration::from_secs(60));

        poller.poll_once().await;
        assert!(!path.exists());

        let slot = SlotIdentifier::new(settings("rig").identifier(), Some(0));
        let mut benchmark =
            ProteinBenchmark::new(slot, ProteinBenchmarkIdentifier::new(13406, "Ryzen", Some(8)));
        benchmark.add_frame_time(Duration::from_secs(300));
        fleet.services().benchmarks.insert(benchmark);

        poller.poll_once().await;
        assert!(path.exists());
        assert!(!fleet.services().benchmarks.is_dirty());
    }

    #[tokio::test]
    async fn test_loop_retrieves_until_stopped() {
        let fleet = Arc::new(ClientFleet::new(
            ScriptedConnector::new(burst()),
            ClientServices::in_memory(),
        ));
        fleet.add(settings("rig")).await.unwrap();
        let mut events = fleet.services().events.subscribe();

        let poller = RetrievePoller::new(Arc::clone(&fleet), Duration::from_millis(20));
        let handle = poller.start();

        let mut retrieves = 0;
        while retrieves < 3 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event before timeout")
                .unwrap();
            if matches!(event, FleetEvent::RetrieveFinished { .. }) {
                retrieves += 1;
            }
        }

        poller.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller stops")
            .unwrap();
    }
}
