use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use job_sync::{
    AbortSignal, PollJob, PollKind, PollScheduler, PollSettings, PollUpdate, SyncError, SyncResult,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Fails until `recover_after` requests were made, recording each start time.
struct FlakyList {
    origin: Instant,
    starts: Arc<Mutex<Vec<Duration>>>,
    recover_after: usize,
}

#[async_trait]
impl PollJob for FlakyList {
    fn kind(&self) -> PollKind {
        PollKind::Jobs
    }

    async fn fetch(&self) -> SyncResult<Option<PollUpdate>> {
        let made = {
            let mut starts = self.starts.lock();
            starts.push(self.origin.elapsed());
            starts.len()
        };
        if made <= self.recover_after {
            Err(SyncError::Decode("backend unavailable".into()))
        } else {
            Ok(Some(PollUpdate::Jobs {
                jobs: Vec::new(),
                selected: None,
            }))
        }
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn job_poll_backoff_is_capped_and_resets() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let poll = FlakyList {
        origin: Instant::now(),
        starts: starts.clone(),
        recover_after: 6,
    };
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = PollScheduler::new(
        poll,
        PollSettings::jobs(),
        Duration::from_secs(10),
        tx,
    );
    let (token, signal) = AbortSignal::detached();
    let task = tokio::spawn(scheduler.run(signal));

    let mut failures = 0;
    for _ in 0..8 {
        let report = rx.recv().await.expect("report");
        assert_eq!(report.kind, PollKind::Jobs);
        if report.outcome.is_err() {
            failures += 1;
        }
    }
    token.cancel();
    task.await.expect("scheduler");

    assert_eq!(failures, 6);
    let gaps: Vec<u64> = starts
        .lock()
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_secs())
        .collect();
    // 5s doubling to the 60s ceiling, then back to 5s after the first success
    assert_eq!(gaps, vec![10, 20, 40, 60, 60, 60, 5]);
}
