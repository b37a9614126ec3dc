use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::SourceError;
use crate::models::{Student, StudentId, StudentSummary};

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<StudentSummary>, SourceError>;

    /// Full record for one student, `Ok(None)` when the id is unknown.
    async fn fetch_by_id(&self, id: StudentId) -> Result<Option<Student>, SourceError>;

    async fn create(&self, student: &Student) -> Result<(), SourceError>;

    async fn replace(&self, student: &Student) -> Result<(), SourceError>;

    async fn delete(&self, id: StudentId) -> Result<(), SourceError>;

    /// One detail fetch per listed student. Students deleted in between are skipped.
    async fn fetch_all_detailed(&self) -> Result<Vec<Student>, SourceError> {
        let summaries = self.fetch_all().await?;
        let mut students = Vec::with_capacity(summaries.len());
        for summary in summaries {
            match self.fetch_by_id(summary.id).await? {
                Some(student) => students.push(student),
                None => debug!(student_id = summary.id, "student vanished during detail fetch"),
            }
        }
        Ok(students)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    Create(Student),
    Replace(Student),
    Delete(StudentId),
}

/// Process-local roster store with fetch counters and failure switches.
#[derive(Debug, Default)]
pub struct InMemoryDataSource {
    students: RwLock<BTreeMap<StudentId, Student>>,
    writes: RwLock<Vec<WriteRecord>>,
    fetch_all_calls: AtomicUsize,
    fetch_by_id_calls: AtomicUsize,
    fail_fetches: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_students(students: impl IntoIterator<Item = Student>) -> Self {
        let source = Self::new();
        source.set_students(students);
        source
    }

    pub fn from_csv(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::with_students(read_roster_csv(path)?))
    }

    pub fn set_students(&self, students: impl IntoIterator<Item = Student>) {
        let mut guard = self.students.write();
        guard.clear();
        guard.extend(students.into_iter().map(|s| (s.id, s)));
    }

    pub fn upsert(&self, student: Student) {
        self.students.write().insert(student.id, student);
    }

    pub fn student(&self, id: StudentId) -> Option<Student> {
        self.students.read().get(&id).cloned()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.read().clone()
    }

    pub fn fetch_all_calls(&self) -> usize {
        self.fetch_all_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_by_id_calls(&self) -> usize {
        self.fetch_by_id_calls.load(Ordering::SeqCst)
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_fetch(&self) -> Result<(), SourceError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(SourceError::Transport("roster service unavailable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), SourceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SourceError::Rejected("write refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataSource for InMemoryDataSource {
    async fn fetch_all(&self) -> Result<Vec<StudentSummary>, SourceError> {
        self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
        self.check_fetch()?;
        Ok(self.students.read().values().map(Student::summary).collect())
    }

    async fn fetch_by_id(&self, id: StudentId) -> Result<Option<Student>, SourceError> {
        self.fetch_by_id_calls.fetch_add(1, Ordering::SeqCst);
        self.check_fetch()?;
        Ok(self.students.read().get(&id).cloned())
    }

    async fn create(&self, student: &Student) -> Result<(), SourceError> {
        self.check_write()?;
        let mut guard = self.students.write();
        let mut stored = student.clone();
        // Ids are assigned by the store when the caller leaves them unset.
        if stored.id <= 0 {
            stored.id = guard.keys().next_back().copied().unwrap_or(0) + 1;
        } else if guard.contains_key(&stored.id) {
            return Err(SourceError::Rejected(format!(
                "student {} already exists",
                stored.id
            )));
        }
        guard.insert(stored.id, stored.clone());
        self.writes.write().push(WriteRecord::Create(stored));
        Ok(())
    }

    async fn replace(&self, student: &Student) -> Result<(), SourceError> {
        self.check_write()?;
        let mut guard = self.students.write();
        if !guard.contains_key(&student.id) {
            return Err(SourceError::Rejected(format!(
                "student {} does not exist",
                student.id
            )));
        }
        guard.insert(student.id, student.clone());
        self.writes.write().push(WriteRecord::Replace(student.clone()));
        Ok(())
    }

    async fn delete(&self, id: StudentId) -> Result<(), SourceError> {
        self.check_write()?;
        if self.students.write().remove(&id).is_none() {
            return Err(SourceError::Rejected(format!("student {id} does not exist")));
        }
        self.writes.write().push(WriteRecord::Delete(id));
        Ok(())
    }
}

/// Load a roster from CSV with `id,name,age,grades,attendance` columns.
///
/// List cells are `;`-separated; attendance accepts `1/0`, `true/false` or `p/a`.
pub fn read_roster_csv(path: &Path) -> anyhow::Result<Vec<Student>> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        id: StudentId,
        name: String,
        age: u32,
        #[serde(default)]
        grades: String,
        #[serde(default)]
        attendance: String,
    }

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open roster csv {}", path.display()))?;
    let mut students = Vec::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("bad roster row {}", line + 1))?;
        let grades = split_cells(&row.grades)
            .map(|cell| {
                cell.parse::<f64>()
                    .with_context(|| format!("bad grade `{cell}` for student {}", row.id))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let attendance = split_cells(&row.attendance)
            .map(|cell| parse_presence(cell).with_context(|| {
                format!("bad attendance `{cell}` for student {}", row.id)
            }))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let student = Student {
            id: row.id,
            name: row.name,
            age: row.age,
            grades,
            attendance,
        };
        student
            .validate()
            .with_context(|| format!("invalid student {}", student.id))?;
        students.push(student);
    }

    Ok(students)
}

fn split_cells(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|cell| !cell.is_empty())
}

fn parse_presence(cell: &str) -> anyhow::Result<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "1" | "true" | "p" | "present" => Ok(true),
        "0" | "false" | "a" | "absent" => Ok(false),
        other => anyhow::bail!("unrecognised attendance marker `{other}`"),
    }
}
