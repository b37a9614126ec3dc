use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ChangeDetectingCache;
use crate::config::{EngineConfig, PublishPolicy};
use crate::error::SchedulerError;
use crate::models::{RosterSnapshot, StatisticsResult, Student, StudentId, StudentSummary};
use crate::mutation::{Mutation, MutationCoordinator, MutationOutcome, MutationTicket};
use crate::scheduler::{CycleFailure, ErrorSink, PollScheduler};
use crate::source::DataSource;
use crate::stats::StatisticsAggregator;

type CycleFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct RosterEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    this: Weak<EngineShared>,
    source: Arc<dyn DataSource>,
    config: EngineConfig,
    aggregator: StatisticsAggregator,

    roster_cache: ChangeDetectingCache<StudentSummary>,
    detail_cache: ChangeDetectingCache<Student>,
    roster_loaded: AtomicBool,

    roster_tx: watch::Sender<RosterSnapshot<StudentSummary>>,
    statistics_tx: watch::Sender<Option<StatisticsResult>>,
    student_tx: watch::Sender<Option<Student>>,
    failures_tx: Arc<watch::Sender<Option<CycleFailure>>>,

    roster_poller: PollScheduler,
    statistics_poller: PollScheduler,
    detail_poller: PollScheduler,
    watched_student: Mutex<Option<StudentId>>,

    mutations: MutationCoordinator,
}

impl RosterEngine {
    pub fn new(source: Arc<dyn DataSource>, config: EngineConfig) -> Self {
        let (roster_tx, _) = watch::channel(RosterSnapshot::empty());
        let (statistics_tx, _) = watch::channel(None);
        let (student_tx, _) = watch::channel(None);
        let (failures_tx, _) = watch::channel(None);
        let failures_tx = Arc::new(failures_tx);

        let scheduler = |name: &str| {
            PollScheduler::new(name)
                .with_error_sink(failure_sink(Arc::clone(&failures_tx)))
                .with_shutdown_grace(config.shutdown_grace)
        };
        let roster_poller = scheduler("roster");
        let statistics_poller = scheduler("statistics");
        let detail_poller = scheduler("student-detail");

        let mutations = MutationCoordinator::new(Arc::clone(&source))
            .with_shutdown_grace(config.shutdown_grace);
        let aggregator = StatisticsAggregator::new(config.thresholds);

        let shared = Arc::new_cyclic(|this| EngineShared {
            this: this.clone(),
            source,
            config,
            aggregator,
            roster_cache: ChangeDetectingCache::new(),
            detail_cache: ChangeDetectingCache::new(),
            roster_loaded: AtomicBool::new(false),
            roster_tx,
            statistics_tx,
            student_tx,
            failures_tx,
            roster_poller,
            statistics_poller,
            detail_poller,
            watched_student: Mutex::new(None),
            mutations,
        });

        Self { shared }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start roster and statistics polling. Already-running pollers keep their phase.
    pub fn start_polling(&self) -> Result<(), SchedulerError> {
        let shared = &self.shared;
        shared
            .roster_poller
            .start(shared.roster_cycle(), shared.config.roster_interval)?;
        shared
            .statistics_poller
            .start(shared.statistics_cycle(), shared.config.statistics_interval)?;
        Ok(())
    }

    pub fn stop_polling(&self) {
        self.shared.roster_poller.stop();
        self.shared.statistics_poller.stop();
        self.shared.detail_poller.stop();
    }

    pub fn force_refresh(&self) -> Result<(), SchedulerError> {
        let shared = &self.shared;
        info!("forced refresh");
        shared
            .roster_poller
            .restart(shared.roster_cycle(), shared.config.roster_interval)?;
        shared
            .statistics_poller
            .restart(shared.statistics_cycle(), shared.config.statistics_interval)?;
        let watched = *shared.watched_student.lock();
        if let Some(id) = watched {
            shared
                .detail_poller
                .restart(shared.detail_cycle(id), shared.config.detail_interval)?;
        }
        Ok(())
    }

    /// Selecting a different student clears the published record.
    pub fn watch_student(&self, id: StudentId) -> Result<(), SchedulerError> {
        let shared = &self.shared;
        let previous = shared.watched_student.lock().replace(id);
        if previous != Some(id) {
            shared
                .student_tx
                .send_if_modified(|current| current.take().is_some());
        }
        shared
            .detail_poller
            .restart(shared.detail_cycle(id), shared.config.detail_interval)
    }

    pub fn stop_watching_student(&self) {
        self.shared.watched_student.lock().take();
        self.shared.detail_poller.stop();
    }

    pub fn submit_mutation(&self, mutation: Mutation) -> MutationTicket {
        self.shared.mutations.submit(mutation)
    }

    pub fn submit_mutation_with_callback<C>(&self, mutation: Mutation, callback: C) -> Uuid
    where
        C: FnOnce(MutationOutcome) + Send + 'static,
    {
        self.shared.mutations.submit_with_callback(mutation, callback)
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<RosterSnapshot<StudentSummary>> {
        self.shared.roster_tx.subscribe()
    }

    /// `None` until the first statistics cycle succeeds.
    pub fn subscribe_statistics(&self) -> watch::Receiver<Option<StatisticsResult>> {
        self.shared.statistics_tx.subscribe()
    }

    pub fn subscribe_student(&self) -> watch::Receiver<Option<Student>> {
        self.shared.student_tx.subscribe()
    }

    pub fn subscribe_failures(&self) -> watch::Receiver<Option<CycleFailure>> {
        self.shared.failures_tx.subscribe()
    }

    pub fn current_roster(&self) -> RosterSnapshot<StudentSummary> {
        self.shared.roster_cache.get()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.roster_poller.is_running()
    }

    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.roster_poller.shutdown().await;
        shared.statistics_poller.shutdown().await;
        shared.detail_poller.shutdown().await;
        shared.mutations.shutdown().await;
        info!("roster engine shut down");
    }
}

impl EngineShared {
    fn roster_cycle(&self) -> CycleFn {
        let this = self.this.clone();
        Box::new(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(shared) => shared.poll_roster().await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    fn statistics_cycle(&self) -> CycleFn {
        let this = self.this.clone();
        Box::new(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(shared) => shared.poll_statistics().await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    fn detail_cycle(&self, id: StudentId) -> CycleFn {
        let this = self.this.clone();
        Box::new(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(shared) => shared.poll_student(id).await,
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }

    async fn poll_roster(&self) -> anyhow::Result<()> {
        let students = self
            .source
            .fetch_all()
            .await
            .context("failed to fetch roster")?;
        let snapshot = RosterSnapshot::new(students);
        let changed = self.roster_cache.update(snapshot.clone());
        let first_load = !self.roster_loaded.swap(true, Ordering::SeqCst);

        if changed || first_load || self.config.roster_policy == PublishPolicy::EveryTick {
            debug!(students = snapshot.len(), changed, "publishing roster");
            self.roster_tx.send_replace(snapshot);
        } else {
            debug!("roster unchanged");
        }

        // The statistics poller already fetches on its own first cycle.
        if changed && !first_load {
            self.statistics_poller
                .restart_if_running(self.statistics_cycle(), self.config.statistics_interval);
        }
        Ok(())
    }

    async fn poll_statistics(&self) -> anyhow::Result<()> {
        let students = self
            .source
            .fetch_all_detailed()
            .await
            .context("failed to fetch detailed roster")?;
        let snapshot = RosterSnapshot::new(students);
        let changed = self.detail_cache.update(snapshot.clone());
        let never_published = self.statistics_tx.borrow().is_none();

        if self.config.statistics_policy == PublishPolicy::OnChange && !changed && !never_published
        {
            debug!("detailed roster unchanged, statistics kept");
            return Ok(());
        }

        let result = self.aggregator.compute(snapshot.entries());
        info!(
            students = result.student_count(),
            passed = result.passed.len(),
            failed = result.failed.len(),
            "statistics recomputed"
        );
        self.statistics_tx.send_replace(Some(result));
        Ok(())
    }

    async fn poll_student(&self, id: StudentId) -> anyhow::Result<()> {
        let student = self
            .source
            .fetch_by_id(id)
            .await
            .with_context(|| format!("failed to fetch student {id}"))?;

        // The selection may have moved on while the fetch was in flight.
        if *self.watched_student.lock() != Some(id) {
            return Ok(());
        }
        match student {
            Some(student) => {
                self.student_tx.send_replace(Some(student));
            }
            None => warn!(student_id = id, "watched student not found"),
        }
        Ok(())
    }
}

fn failure_sink(failures_tx: Arc<watch::Sender<Option<CycleFailure>>>) -> ErrorSink {
    Arc::new(move |failure| {
        failures_tx.send_replace(Some(failure));
    })
}
