//! Pour report delivery.
//!
//! Reports are queued to a worker thread so a slow or failing ledger never
//! holds up pour detection. Each report is retried with exponential backoff
//! and, once attempts are exhausted, logged and written to the undelivered
//! journal. Dropped reports are not replayed automatically.

use crate::journal::Journal;
use crate::{PourReceipt, PourReport, Result, UndeliveredPour};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The pour-recording operation provided by the keg ledger.
///
/// Must decrement the keg's remaining volume and append a history entry
/// atomically from the caller's point of view, and be safe to call
/// concurrently with manual pours.
pub trait PourLedger: Send + Sync {
    fn record_pour(&self, report: &PourReport) -> Result<PourReceipt>;
}

/// Bounded retry with exponential backoff
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Counters shared between the worker and diagnostics
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

/// Copy of [`DeliveryStats`] for display
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub delivered: u64,
    pub retries: u64,
    pub dropped: u64,
}

impl DeliveryStats {
    pub fn counts(&self) -> DeliveryCounts {
        DeliveryCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Deliver one report, retrying per `policy`.
///
/// Returns the number of attempts made and the final error on failure.
pub fn deliver_with_retry(
    ledger: &dyn PourLedger,
    report: &PourReport,
    policy: &RetryPolicy,
    stats: &DeliveryStats,
) -> std::result::Result<PourReceipt, (u32, String)> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ledger.record_pour(report) {
            Ok(receipt) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Recorded {:.1}ml from tap {} against keg {} ({:.2}L left)",
                    report.volume * 1000.0,
                    report.tap,
                    receipt.keg_id,
                    receipt.volume_remaining
                );
                return Ok(receipt);
            }
            Err(e) if attempt < max_attempts => {
                let delay = policy.backoff_for(attempt);
                stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Delivery attempt {}/{} for tap {} failed: {}. Retrying in {:?}",
                    attempt,
                    max_attempts,
                    report.tap,
                    e,
                    delay
                );
                thread::sleep(delay);
            }
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Err((attempt, e.to_string()));
            }
        }
    }
}

/// Background worker feeding reports to the ledger
pub struct ReportDispatcher {
    sender: Option<Sender<PourReport>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<DeliveryStats>,
}

impl ReportDispatcher {
    /// Spawn the worker.
    ///
    /// `undelivered` receives reports that exhausted their attempts.
    pub fn spawn(
        ledger: Arc<dyn PourLedger>,
        policy: RetryPolicy,
        undelivered: Option<Journal>,
        stats: Arc<DeliveryStats>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<PourReport>();
        let worker_stats = stats.clone();

        let handle = thread::Builder::new()
            .name("pour-delivery".into())
            .spawn(move || {
                for report in receiver {
                    if let Err((attempts, last_error)) =
                        deliver_with_retry(ledger.as_ref(), &report, &policy, &worker_stats)
                    {
                        tracing::error!(
                            "Dropping {:.1}ml pour from tap {} after {} attempts: {}. \
                             Reconcile against the meter totals manually.",
                            report.volume * 1000.0,
                            report.tap,
                            attempts,
                            last_error
                        );
                        if let Some(journal) = &undelivered {
                            let entry = UndeliveredPour {
                                report,
                                attempts,
                                last_error,
                                dropped_at: Utc::now(),
                            };
                            if let Err(e) = journal.append(&entry) {
                                tracing::error!("Failed to journal undelivered pour: {}", e);
                            }
                        }
                    }
                }
                tracing::debug!("Delivery worker finished");
            })?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            stats,
        })
    }

    /// Queue a report. Never blocks on the ledger.
    pub fn dispatch(&self, report: PourReport) {
        match &self.sender {
            Some(sender) => {
                if let Err(e) = sender.send(report) {
                    tracing::error!(
                        "Delivery worker gone, pour from tap {} not queued",
                        e.0.tap
                    );
                }
            }
            None => tracing::error!("Dispatcher already shut down"),
        }
    }

    pub fn stats(&self) -> DeliveryCounts {
        self.stats.counts()
    }

    /// Close the queue and wait for every queued report to be delivered or
    /// dropped.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Delivery worker panicked");
            }
        }
    }
}

impl Drop for ReportDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use uuid::Uuid;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then records
    struct FlakyLedger {
        failures: Mutex<u32>,
        recorded: Mutex<Vec<PourReport>>,
    }

    impl FlakyLedger {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                recorded: Mutex::new(Vec::new()),
            }
        }
    }

    impl PourLedger for FlakyLedger {
        fn record_pour(&self, report: &PourReport) -> Result<PourReceipt> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::LedgerDelivery("ledger offline".into()));
            }
            self.recorded.lock().unwrap().push(report.clone());
            Ok(PourReceipt {
                keg_id: 1,
                volume_remaining: 10.0,
            })
        }
    }

    fn report(volume: f64) -> PourReport {
        PourReport {
            id: Uuid::new_v4(),
            tap: 1,
            volume,
            pulses: (volume * 450.0) as u64,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(100), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_until_success() {
        let ledger = FlakyLedger::new(2);
        let stats = DeliveryStats::default();
        let receipt = deliver_with_retry(&ledger, &report(0.5), &fast_policy(5), &stats).unwrap();
        assert_eq!(receipt.keg_id, 1);
        assert_eq!(
            stats.counts(),
            DeliveryCounts {
                delivered: 1,
                retries: 2,
                dropped: 0
            }
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let ledger = FlakyLedger::new(10);
        let stats = DeliveryStats::default();
        let (attempts, error) =
            deliver_with_retry(&ledger, &report(0.5), &fast_policy(3), &stats).unwrap_err();
        assert_eq!(attempts, 3);
        assert!(error.contains("ledger offline"));
        assert_eq!(stats.counts().dropped, 1);
        assert!(ledger.recorded.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatcher_drains_on_shutdown() {
        let ledger = Arc::new(FlakyLedger::new(1));
        let mut dispatcher = ReportDispatcher::spawn(
            ledger.clone(),
            fast_policy(3),
            None,
            Arc::new(DeliveryStats::default()),
        )
        .unwrap();

        dispatcher.dispatch(report(0.25));
        dispatcher.dispatch(report(0.5));
        dispatcher.shutdown();

        let recorded = ledger.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].volume, 0.25);
        assert_eq!(dispatcher.stats().delivered, 2);
    }

    #[test]
    fn test_dropped_reports_are_journalled() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(temp_dir.path().join("undelivered.jsonl"));
        let ledger = Arc::new(FlakyLedger::new(u32::MAX));

        let mut dispatcher = ReportDispatcher::spawn(
            ledger,
            fast_policy(2),
            Some(journal.clone()),
            Arc::new(DeliveryStats::default()),
        )
        .unwrap();
        dispatcher.dispatch(report(0.3));
        dispatcher.shutdown();

        let dropped: Vec<UndeliveredPour> = journal.read_all().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].attempts, 2);
        assert_eq!(dropped[0].report.volume, 0.3);
    }
}
