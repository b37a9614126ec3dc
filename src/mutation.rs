use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MutationError, SourceError};
use crate::models::{validate_grade, Student, StudentId};
use crate::source::DataSource;

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    AddGrade { student_id: StudentId, grade: f64 },
    AddAttendance { student_id: StudentId, present: bool },
    /// Create a new record. A non-positive id lets the service assign one.
    Register(Student),
    Update(Student),
    Delete { student_id: StudentId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    AddGrade,
    AddAttendance,
    Register,
    Update,
    Delete,
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::AddGrade { .. } => MutationKind::AddGrade,
            Mutation::AddAttendance { .. } => MutationKind::AddAttendance,
            Mutation::Register(_) => MutationKind::Register,
            Mutation::Update(_) => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
        }
    }

    pub fn student_id(&self) -> StudentId {
        match self {
            Mutation::AddGrade { student_id, .. }
            | Mutation::AddAttendance { student_id, .. }
            | Mutation::Delete { student_id } => *student_id,
            Mutation::Register(student) | Mutation::Update(student) => student.id,
        }
    }

    /// Queued requests with the same key supersede each other.
    fn supersede_key(&self) -> Option<(MutationKind, StudentId)> {
        match self {
            Mutation::Register(_) => None,
            other => Some((other.kind(), other.student_id())),
        }
    }
}

pub type MutationOutcome = Result<(), MutationError>;

#[derive(Debug)]
pub struct MutationTicket {
    id: Uuid,
    reply: oneshot::Receiver<MutationOutcome>,
}

impl MutationTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn outcome(self) -> MutationOutcome {
        self.reply.await.unwrap_or(Err(MutationError::Closed))
    }
}

struct Job {
    id: Uuid,
    mutation: Mutation,
    cancel: CancellationToken,
    reply: oneshot::Sender<MutationOutcome>,
}

struct PendingEntry {
    id: Uuid,
    cancel: CancellationToken,
}

type PendingMap = Arc<Mutex<HashMap<(MutationKind, StudentId), PendingEntry>>>;

pub struct MutationCoordinator {
    tx: mpsc::UnboundedSender<Job>,
    pending: PendingMap,
    closed: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl MutationCoordinator {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let worker = tokio::spawn(run_worker(
            source,
            rx,
            Arc::clone(&pending),
            closed.clone(),
        ));

        Self {
            tx,
            pending,
            closed,
            worker: Mutex::new(Some(worker)),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn submit(&self, mutation: Mutation) -> MutationTicket {
        let (reply, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        let ticket = MutationTicket {
            id,
            reply: receiver,
        };

        if self.closed.is_cancelled() {
            let _ = reply.send(Err(MutationError::Closed));
            return ticket;
        }

        let cancel = CancellationToken::new();
        if let Some(key) = mutation.supersede_key() {
            let entry = PendingEntry {
                id,
                cancel: cancel.clone(),
            };
            if let Some(previous) = self.pending.lock().insert(key, entry) {
                previous.cancel.cancel();
                debug!(request_id = %previous.id, superseded_by = %id, "queued mutation superseded");
            }
        }

        debug!(request_id = %id, kind = ?mutation.kind(), student_id = mutation.student_id(), "mutation queued");
        let job = Job {
            id,
            mutation,
            cancel,
            reply,
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            let _ = job.reply.send(Err(MutationError::Closed));
        }
        ticket
    }

    /// Like [`submit`](Self::submit), with the outcome passed to `callback`.
    pub fn submit_with_callback<C>(&self, mutation: Mutation, callback: C) -> Uuid
    where
        C: FnOnce(MutationOutcome) + Send + 'static,
    {
        let ticket = self.submit(mutation);
        let id = ticket.id();
        tokio::spawn(async move {
            callback(ticket.outcome().await);
        });
        id
    }

    pub async fn shutdown(&self) {
        self.closed.cancel();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(self.shutdown_grace, handle).await.is_err() {
            warn!("mutation still running after shutdown grace, aborting");
            abort.abort();
        }
    }
}

impl Drop for MutationCoordinator {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn run_worker(
    source: Arc<dyn DataSource>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    pending: PendingMap,
    closed: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if !claim(&pending, &job) {
            debug!(request_id = %job.id, "skipping superseded mutation");
            let _ = job.reply.send(Err(MutationError::Superseded));
            continue;
        }

        let outcome = AssertUnwindSafe(apply(source.as_ref(), &job.mutation))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(MutationError::Panicked(format!("{:?}", job.mutation.kind()))));

        match &outcome {
            Ok(()) => info!(
                request_id = %job.id,
                kind = ?job.mutation.kind(),
                student_id = job.mutation.student_id(),
                "mutation applied"
            ),
            Err(err) => warn!(
                request_id = %job.id,
                kind = ?job.mutation.kind(),
                student_id = job.mutation.student_id(),
                error = %err,
                "mutation failed"
            ),
        }
        let _ = job.reply.send(outcome);
    }

    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job.reply.send(Err(MutationError::Closed));
    }
}

fn claim(pending: &PendingMap, job: &Job) -> bool {
    let mut pending = pending.lock();
    if job.cancel.is_cancelled() {
        return false;
    }
    if let Some(key) = job.mutation.supersede_key() {
        if pending.get(&key).map(|entry| entry.id) == Some(job.id) {
            pending.remove(&key);
        }
    }
    true
}

async fn apply(source: &dyn DataSource, mutation: &Mutation) -> MutationOutcome {
    match mutation {
        Mutation::AddGrade { student_id, grade } => {
            validate_grade(*grade)?;
            let mut student = fetch_existing(source, *student_id).await?;
            student.grades.push(*grade);
            write_back(source, &student).await
        }
        Mutation::AddAttendance {
            student_id,
            present,
        } => {
            let mut student = fetch_existing(source, *student_id).await?;
            student.attendance.push(*present);
            write_back(source, &student).await
        }
        Mutation::Register(student) => {
            student.validate()?;
            source
                .create(student)
                .await
                .map_err(|err| write_failed(student.id, err))
        }
        Mutation::Update(student) => {
            student.validate()?;
            fetch_existing(source, student.id).await?;
            write_back(source, student).await
        }
        Mutation::Delete { student_id } => {
            fetch_existing(source, *student_id).await?;
            source
                .delete(*student_id)
                .await
                .map_err(|err| write_failed(*student_id, err))
        }
    }
}

async fn fetch_existing(source: &dyn DataSource, id: StudentId) -> Result<Student, MutationError> {
    source
        .fetch_by_id(id)
        .await
        .map_err(|err| MutationError::Transport(err.to_string()))?
        .ok_or(MutationError::NotFound(id))
}

async fn write_back(source: &dyn DataSource, student: &Student) -> MutationOutcome {
    source
        .replace(student)
        .await
        .map_err(|err| write_failed(student.id, err))
}

fn write_failed(student_id: StudentId, err: SourceError) -> MutationError {
    MutationError::WriteFailed {
        student_id,
        reason: err.to_string(),
    }
}
