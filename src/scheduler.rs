use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;

type CycleWork = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Receives every failed cycle. Called on the scheduler's task.
pub type ErrorSink = Arc<dyn Fn(CycleFailure) + Send + Sync>;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub struct CycleFailure {
    pub scheduler: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Terminated,
}

struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    state: SchedulerState,
    active: Option<ScheduledTask>,
    /// Stopped tasks that may still be finishing their last cycle.
    draining: Vec<JoinHandle<()>>,
}

pub struct PollScheduler {
    name: Arc<str>,
    inner: Mutex<Inner>,
    root: CancellationToken,
    run_gate: Arc<tokio::sync::Mutex<()>>,
    error_sink: Option<ErrorSink>,
    shutdown_grace: Duration,
}

impl PollScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: SchedulerState::Idle,
                active: None,
                draining: Vec::new(),
            }),
            root: CancellationToken::new(),
            run_gate: Arc::new(tokio::sync::Mutex::new(())),
            error_sink: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    /// Run `work` now and then `interval` after each cycle completes.
    ///
    /// Returns `Ok(false)` when already running.
    pub fn start<F, Fut>(&self, work: F, interval: Duration) -> Result<bool, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start_boxed(boxed(work), interval)
    }

    fn start_boxed(&self, work: CycleWork, interval: Duration) -> Result<bool, SchedulerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            SchedulerState::Terminated => return Err(SchedulerError::Terminated),
            SchedulerState::Running => return Ok(false),
            SchedulerState::Idle => {}
        }
        self.spawn_locked(&mut inner, work, interval);
        Ok(true)
    }

    fn spawn_locked(&self, inner: &mut Inner, work: CycleWork, interval: Duration) {
        let cancel = self.root.child_token();
        let handle = tokio::spawn(run_schedule(
            Arc::clone(&self.name),
            work,
            interval.max(MIN_INTERVAL),
            cancel.clone(),
            Arc::clone(&self.run_gate),
            self.error_sink.clone(),
        ));

        inner.draining.retain(|handle| !handle.is_finished());
        inner.active = Some(ScheduledTask { cancel, handle });
        inner.state = SchedulerState::Running;
        info!(scheduler = %self.name, interval_ms = interval.as_millis() as u64, "polling started");
    }

    fn cancel_active_locked(inner: &mut Inner) {
        if let Some(task) = inner.active.take() {
            task.cancel.cancel();
            inner.draining.push(task.handle);
        }
    }

    /// Cancel future repetitions. A cycle already in progress runs to completion.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SchedulerState::Running {
            return false;
        }
        Self::cancel_active_locked(&mut inner);
        inner.state = SchedulerState::Idle;
        info!(scheduler = %self.name, "polling stopped");
        true
    }

    /// Stop and start again, so the next cycle runs immediately.
    pub fn restart<F, Fut>(&self, work: F, interval: Duration) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state == SchedulerState::Terminated {
            return Err(SchedulerError::Terminated);
        }
        Self::cancel_active_locked(&mut inner);
        self.spawn_locked(&mut inner, boxed(work), interval);
        Ok(())
    }

    /// Restart only when a schedule is running. Returns whether it restarted.
    pub fn restart_if_running<F, Fut>(&self, work: F, interval: Duration) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.state != SchedulerState::Running {
            return false;
        }
        Self::cancel_active_locked(&mut inner);
        self.spawn_locked(&mut inner, boxed(work), interval);
        true
    }

    /// Stop permanently. In-flight cycles get the grace period, then are aborted.
    pub async fn shutdown(&self) {
        let handles = {
            let mut inner = self.inner.lock();
            if inner.state == SchedulerState::Terminated {
                return;
            }
            inner.state = SchedulerState::Terminated;
            self.root.cancel();
            let mut handles: Vec<JoinHandle<()>> = inner.draining.drain(..).collect();
            if let Some(task) = inner.active.take() {
                handles.push(task.handle);
            }
            handles
        };

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!(scheduler = %self.name, "cycle still running after shutdown grace, aborting");
                abort.abort();
            }
        }
        info!(scheduler = %self.name, "scheduler terminated");
    }
}

fn boxed<F, Fut>(work: F) -> CycleWork
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || work().boxed())
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run_schedule(
    name: Arc<str>,
    work: CycleWork,
    interval: Duration,
    cancel: CancellationToken,
    run_gate: Arc<tokio::sync::Mutex<()>>,
    error_sink: Option<ErrorSink>,
) {
    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&run_gate).lock_owned() => permit,
        };

        let started = Instant::now();
        let cycle = Arc::clone(&work);
        let outcome = AssertUnwindSafe(async move { cycle().await })
            .catch_unwind()
            .await;
        drop(permit);

        let message = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(panic) => Some(format!("cycle panicked: {}", panic_message(panic.as_ref()))),
        };
        match message {
            None => debug!(
                scheduler = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "poll cycle complete"
            ),
            Some(message) => {
                error!(scheduler = %name, error = %message, "poll cycle failed");
                if let Some(sink) = &error_sink {
                    sink(CycleFailure {
                        scheduler: name.to_string(),
                        message,
                        at: Utc::now(),
                    });
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(scheduler = %name, "schedule loop exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn counting_work(counter: Arc<AtomicUsize>) -> impl Fn() -> BoxFuture<'static, anyhow::Result<()>> {
        move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_every_interval() {
        let scheduler = PollScheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));
        assert_eq!(scheduler.start(counting_work(runs.clone()), INTERVAL), Ok(true));

        sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sleep(INTERVAL).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        sleep(INTERVAL * 2).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_does_not_spawn_another_task() {
        let scheduler = PollScheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));
        assert_eq!(scheduler.start(counting_work(runs.clone()), INTERVAL), Ok(true));
        assert_eq!(scheduler.start(counting_work(runs.clone()), INTERVAL), Ok(false));

        sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        sleep(INTERVAL).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_further_cycles() {
        let scheduler = PollScheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .start(counting_work(runs.clone()), INTERVAL)
            .expect("scheduler is live");
        sleep(Duration::from_millis(1)).await;

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        sleep(INTERVAL * 4).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_runs_a_cycle_right_away() {
        let scheduler = PollScheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .start(counting_work(runs.clone()), INTERVAL)
            .expect("scheduler is live");
        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler
            .restart(counting_work(runs.clone()), INTERVAL)
            .expect("scheduler is live");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // The new phase starts from the restart, not from the original start.
        sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn conditional_restart_leaves_a_stopped_schedule_alone() {
        let scheduler = PollScheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(!scheduler.restart_if_running(counting_work(runs.clone()), INTERVAL));
        sleep(INTERVAL).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler
            .start(counting_work(runs.clone()), INTERVAL)
            .expect("scheduler is live");
        sleep(Duration::from_secs(10)).await;
        assert!(scheduler.restart_if_running(counting_work(runs.clone()), INTERVAL));
        sleep(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        scheduler.stop();
        assert!(!scheduler.restart_if_running(counting_work(runs.clone()), INTERVAL));
        sleep(INTERVAL * 3).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
        assert!(!scheduler.restart_if_running(counting_work(runs.clone()), INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_cycles_do_not_break_the_schedule() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink_failures = Arc::clone(&failures);
        let scheduler = PollScheduler::new("flaky").with_error_sink(Arc::new(move |failure| {
            sink_failures.lock().push(failure);
        }));

        let runs = Arc::new(AtomicUsize::new(0));
        let work_runs = Arc::clone(&runs);
        scheduler
            .start(
                move || {
                    let attempt = work_runs.fetch_add(1, Ordering::SeqCst);
                    async move {
                        match attempt {
                            0 => anyhow::bail!("roster service unavailable"),
                            1 => panic!("malformed payload"),
                            _ => Ok(()),
                        }
                    }
                },
                INTERVAL,
            )
            .expect("scheduler is live");

        sleep(Duration::from_millis(1)).await;
        sleep(INTERVAL * 2).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let failures = failures.lock();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].scheduler, "flaky");
        assert_eq!(failures[0].message, "roster service unavailable");
        assert_eq!(failures[1].message, "cycle panicked: malformed payload");
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_mid_cycle_never_overlaps() {
        let scheduler = PollScheduler::new("slow");
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let make_work = || {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let completed = Arc::clone(&completed);
            move || {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                let completed = Arc::clone(&completed);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_secs(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };

        scheduler.start(make_work(), INTERVAL).expect("scheduler is live");
        sleep(Duration::from_secs(1)).await;
        scheduler.restart(make_work(), INTERVAL).expect("scheduler is live");

        // The interrupted cycle still completes; the new one waits for it.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_terminal_and_idempotent() {
        let scheduler = PollScheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .start(counting_work(runs.clone()), INTERVAL)
            .expect("scheduler is live");
        sleep(Duration::from_millis(1)).await;

        scheduler.shutdown().await;
        scheduler.shutdown().await;
        assert_eq!(scheduler.state(), SchedulerState::Terminated);
        assert_eq!(
            scheduler.start(counting_work(runs.clone()), INTERVAL),
            Err(SchedulerError::Terminated)
        );
        assert_eq!(
            scheduler.restart(counting_work(runs.clone()), INTERVAL),
            Err(SchedulerError::Terminated)
        );

        sleep(INTERVAL * 2).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_a_stuck_cycle_after_grace() {
        let scheduler =
            PollScheduler::new("stuck").with_shutdown_grace(Duration::from_secs(5));
        scheduler
            .start(
                || async {
                    futures::future::pending::<()>().await;
                    Ok(())
                },
                INTERVAL,
            )
            .expect("scheduler is live");
        sleep(Duration::from_millis(1)).await;

        let began = tokio::time::Instant::now();
        scheduler.shutdown().await;
        assert!(began.elapsed() >= Duration::from_secs(5));
        assert_eq!(scheduler.state(), SchedulerState::Terminated);
    }
}
