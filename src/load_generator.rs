/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    datasenders::{DataSender, SendFailure},
    errors::ScenarioError,
};
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MIN_TICK: Duration = Duration::from_millis(1);
const MAX_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadLimit {
    Duration(Duration),
    Count(u64),
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub items_per_second: u64,
    pub items_per_batch: u64,
    pub limit: LoadLimit,
    /// Retries after the first attempt of a sender call, so a call is attempted at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Doubled after every failed attempt.
    pub retry_backoff: Duration,
    pub send_timeout: Duration,
}
impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            items_per_second: 10_000,
            items_per_batch: 100,
            limit: LoadLimit::Duration(Duration::from_secs(15)),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            send_timeout: Duration::from_secs(5),
        }
    }
}
impl LoadOptions {
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.items_per_second == 0 {
            return Err(ScenarioError::config("items_per_second must be positive"));
        }
        if self.items_per_batch == 0 {
            return Err(ScenarioError::config("items_per_batch must be positive"));
        }
        match self.limit {
            LoadLimit::Duration(duration) if duration.is_zero() => {
                Err(ScenarioError::config("load duration must be positive"))
            }
            LoadLimit::Count(0) => Err(ScenarioError::config("item count must be positive")),
            _ => Ok(()),
        }
    }

    /// How long a batch takes at the target rate, clamped to a range that keeps pacing smooth
    /// without spinning.
    fn tick(&self) -> Duration {
        let secs = self.items_per_batch as f64 / self.items_per_second.max(1) as f64;
        Duration::from_secs_f64(secs).clamp(MIN_TICK, MAX_TICK)
    }

    /// Total number of items that should have been sent `elapsed` into the run.
    fn due(&self, elapsed: Duration) -> u64 {
        let items_at = |elapsed: Duration| {
            (self.items_per_second as u128 * elapsed.as_nanos() / 1_000_000_000) as u64
        };

        match self.limit {
            LoadLimit::Duration(duration) => items_at(elapsed.min(duration)),
            LoadLimit::Count(count) => items_at(elapsed).min(count),
        }
    }

    fn is_complete(&self, elapsed: Duration, items_sent: u64) -> bool {
        match self.limit {
            LoadLimit::Duration(duration) => {
                elapsed >= duration && items_sent >= self.due(duration)
            }
            LoadLimit::Count(count) => items_sent >= count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStats {
    pub items_sent: u64,
    pub elapsed: Duration,
    pub batches: u64,
    pub retries: u64,
    pub cancelled: bool,
}
impl LoadStats {
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.items_sent as f64 / secs
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{operation} failed after {attempts} attempt(s), {items_sent} item(s) sent: {failure}")]
pub struct LoadError {
    pub operation: &'static str,
    pub attempts: u32,
    pub items_sent: u64,
    pub failure: SendFailure,
}
impl From<LoadError> for ScenarioError {
    fn from(err: LoadError) -> Self {
        ScenarioError::Send {
            attempts: err.attempts,
            message: format!("{} failed: {}", err.operation, err.failure),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Start,
    Send(u64),
    Flush,
}
impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Send(_) => "send",
            Operation::Flush => "flush",
        }
    }
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Send(count) => write!(f, "send({count})"),
            op => write!(f, "{}", op.name()),
        }
    }
}

/// Starts generating load on a background task.
///
/// The generator starts the sender, then on every tick works out how many items should have
/// been sent by now at `options.items_per_second` and sends the shortfall in batches of at most
/// `options.items_per_batch`. Once the limit is reached the sender is flushed, so the count in the
/// returned `LoadStats` is final.
///
/// Cancelling `token` stops the generator at the next batch boundary. A cancelled generator still
/// returns `Ok` with the items sent so far and `cancelled` set.
pub fn start_load(
    sender: Box<dyn DataSender>,
    options: LoadOptions,
    token: CancellationToken,
) -> JoinHandle<Result<LoadStats, LoadError>> {
    tokio::spawn(LoadGenerator::new(sender, options, token).run())
}

struct LoadGenerator {
    sender: Box<dyn DataSender>,
    options: LoadOptions,
    token: CancellationToken,
    stats: LoadStats,
}
impl LoadGenerator {
    fn new(sender: Box<dyn DataSender>, options: LoadOptions, token: CancellationToken) -> Self {
        Self {
            sender,
            options,
            token,
            stats: LoadStats::default(),
        }
    }

    async fn run(mut self) -> Result<LoadStats, LoadError> {
        if let Err(err) = self.with_retries(Operation::Start).await {
            return self.cancelled_or(err);
        }

        info!(
            "Generating load through {} at {} items/s ({:?})",
            self.sender.name(),
            self.options.items_per_second,
            self.options.limit
        );

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.options.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'pacing: loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.stats.cancelled = true;
                    break 'pacing;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = started.elapsed();
            let due = self.options.due(elapsed);
            while self.stats.items_sent < due {
                let batch = (due - self.stats.items_sent).min(self.options.items_per_batch);
                if let Err(err) = self.with_retries(Operation::Send(batch)).await {
                    self.stats.elapsed = started.elapsed();
                    return self.cancelled_or(err);
                }

                self.stats.items_sent += batch;
                self.stats.batches += 1;
                trace!("Sent batch of {} ({} total)", batch, self.stats.items_sent);

                if self.token.is_cancelled() {
                    self.stats.cancelled = true;
                    break 'pacing;
                }
            }

            if self
                .options
                .is_complete(started.elapsed(), self.stats.items_sent)
            {
                break;
            }
        }

        if let Err(err) = self.with_retries(Operation::Flush).await {
            self.stats.elapsed = started.elapsed();
            return self.cancelled_or(err);
        }
        self.stats.elapsed = started.elapsed();

        debug!(
            "Load finished: {} item(s) in {:?} ({:.1} items/s, {} retries)",
            self.stats.items_sent,
            self.stats.elapsed,
            self.stats.throughput(),
            self.stats.retries
        );
        Ok(self.stats)
    }

    /// Failures caused by cancellation are not failures of the sender.
    fn cancelled_or(mut self, err: LoadError) -> Result<LoadStats, LoadError> {
        if self.token.is_cancelled() {
            self.stats.cancelled = true;
            Ok(self.stats)
        } else {
            Err(err)
        }
    }

    async fn invoke(&mut self, op: Operation) -> Result<(), SendFailure> {
        match op {
            Operation::Start => self.sender.start().await,
            Operation::Send(count) => self.sender.send(count).await,
            Operation::Flush => self.sender.flush().await,
        }
    }

    async fn with_retries(&mut self, op: Operation) -> Result<(), LoadError> {
        let send_timeout = self.options.send_timeout;
        let mut attempts = 0;
        let mut backoff = self.options.retry_backoff;

        loop {
            attempts += 1;
            let failure = match tokio::time::timeout(send_timeout, self.invoke(op)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(failure)) => failure,
                Err(_) => SendFailure::Transient(format!("{op} timed out after {send_timeout:?}")),
            };

            if failure.is_fatal()
                || attempts > self.options.max_retries
                || self.token.is_cancelled()
            {
                return Err(LoadError {
                    operation: op.name(),
                    attempts,
                    items_sent: self.stats.items_sent,
                    failure,
                });
            }

            warn!(
                "Attempt {} of {} failed, retrying in {:?}: {}",
                attempts, op, backoff, failure
            );
            self.stats.retries += 1;

            tokio::select! {
                _ = self.token.cancelled() => {
                    return Err(LoadError {
                        operation: op.name(),
                        attempts,
                        items_sent: self.stats.items_sent,
                        failure,
                    });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datareceivers::{loopback::loopback_pair, DataReceiver};
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    enum Step {
        Fail(SendFailure),
        Hang,
    }

    /// Counts delivered items, failing or hanging on the first few sends as scripted.
    struct FlakySender {
        delivered: Arc<AtomicU64>,
        script: VecDeque<Step>,
    }
    impl FlakySender {
        fn new(script: Vec<Step>) -> (Self, Arc<AtomicU64>) {
            let delivered = Arc::new(AtomicU64::new(0));
            let sender = Self {
                delivered: delivered.clone(),
                script: script.into(),
            };
            (sender, delivered)
        }
    }

    #[async_trait]
    impl DataSender for FlakySender {
        fn name(&self) -> &str {
            "flaky"
        }

        fn receiver_config_fragment(&self) -> String {
            "nop:\n".to_string()
        }

        async fn start(&mut self) -> Result<(), SendFailure> {
            Ok(())
        }

        async fn send(&mut self, count: u64) -> Result<(), SendFailure> {
            match self.script.pop_front() {
                Some(Step::Fail(failure)) => Err(failure),
                Some(Step::Hang) => std::future::pending().await,
                None => {
                    self.delivered.fetch_add(count, Ordering::Relaxed);
                    Ok(())
                }
            }
        }

        async fn flush(&mut self) -> Result<(), SendFailure> {
            Ok(())
        }
    }

    fn options(items_per_second: u64, limit: LoadLimit) -> LoadOptions {
        LoadOptions {
            items_per_second,
            limit,
            ..Default::default()
        }
    }

    #[test]
    fn due_is_capped_by_the_limit() {
        let by_count = options(1000, LoadLimit::Count(500));
        assert_eq!(by_count.due(Duration::from_millis(250)), 250);
        assert_eq!(by_count.due(Duration::from_secs(10)), 500);

        let by_duration = options(1000, LoadLimit::Duration(Duration::from_secs(2)));
        assert_eq!(by_duration.due(Duration::from_secs(1)), 1000);
        assert_eq!(by_duration.due(Duration::from_secs(5)), 2000);
    }

    #[test]
    fn invalid_options_are_config_errors() {
        let zero_rate = options(0, LoadLimit::Count(10));
        assert!(matches!(
            zero_rate.validate(),
            Err(ScenarioError::Config { .. })
        ));

        let zero_duration = options(10, LoadLimit::Duration(Duration::ZERO));
        assert!(zero_duration.validate().is_err());
        assert!(options(10, LoadLimit::Count(1)).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn count_limit_sends_exactly_n_items() -> anyhow::Result<()> {
        let (sender, receiver) = loopback_pair();
        let handle = start_load(
            Box::new(sender),
            options(1000, LoadLimit::Count(2500)),
            CancellationToken::new(),
        );

        let stats = handle.await??;
        assert_eq!(stats.items_sent, 2500);
        assert_eq!(receiver.received_count()?, 2500);
        assert!(stats.elapsed >= Duration::from_millis(2400));
        assert!(stats.elapsed <= Duration::from_millis(2600));
        assert!(!stats.cancelled);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn duration_limit_converges_on_the_target_rate() -> anyhow::Result<()> {
        let (sender, receiver) = loopback_pair();
        let handle = start_load(
            Box::new(sender),
            options(2000, LoadLimit::Duration(Duration::from_secs(3))),
            CancellationToken::new(),
        );

        let stats = handle.await??;
        assert_eq!(stats.items_sent, 6000);
        assert_eq!(receiver.received_count()?, 6000);
        assert!((stats.throughput() - 2000.0).abs() <= 100.0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() -> anyhow::Result<()> {
        let (sender, delivered) = FlakySender::new(vec![
            Step::Fail(SendFailure::Transient("connection refused".to_string())),
            Step::Fail(SendFailure::Transient("connection refused".to_string())),
        ]);
        let handle = start_load(
            Box::new(sender),
            options(1000, LoadLimit::Count(300)),
            CancellationToken::new(),
        );

        let stats = handle.await??;
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.items_sent, 300);
        assert_eq!(delivered.load(Ordering::Relaxed), 300);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_not_retried() -> anyhow::Result<()> {
        let (sender, _) = FlakySender::new(vec![Step::Fail(SendFailure::Fatal(
            "unsupported".to_string(),
        ))]);
        let handle = start_load(
            Box::new(sender),
            options(1000, LoadLimit::Count(300)),
            CancellationToken::new(),
        );

        let err = handle.await?.err();
        assert_eq!(err.as_ref().map(|err| err.attempts), Some(1));
        assert_eq!(err.map(|err| err.operation), Some("send"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_a_send_error() -> anyhow::Result<()> {
        let refused = || Step::Fail(SendFailure::Transient("connection refused".to_string()));
        let (sender, _) = FlakySender::new(vec![refused(), refused(), refused()]);
        let mut opts = options(1000, LoadLimit::Count(300));
        opts.max_retries = 2;

        let err = start_load(Box::new(sender), opts, CancellationToken::new())
            .await?
            .err();
        assert_eq!(err.as_ref().map(|err| err.attempts), Some(3));

        let scenario_err = err.map(ScenarioError::from);
        assert!(matches!(
            scenario_err,
            Some(ScenarioError::Send { attempts: 3, .. })
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out_and_is_retried() -> anyhow::Result<()> {
        let (sender, delivered) = FlakySender::new(vec![Step::Hang]);
        let mut opts = options(1000, LoadLimit::Count(100));
        opts.send_timeout = Duration::from_secs(1);

        let stats = start_load(Box::new(sender), opts, CancellationToken::new()).await??;
        assert_eq!(stats.retries, 1);
        assert_eq!(delivered.load(Ordering::Relaxed), 100);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_generator_reports_what_it_sent() -> anyhow::Result<()> {
        let (sender, receiver) = loopback_pair();
        let token = CancellationToken::new();
        let handle = start_load(
            Box::new(sender),
            options(100, LoadLimit::Duration(Duration::from_secs(60))),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let stats = handle.await??;
        assert!(stats.cancelled);
        assert!(stats.items_sent > 0);
        assert!(stats.items_sent < 6000);
        assert_eq!(receiver.received_count()?, stats.items_sent);
        Ok(())
    }
}
