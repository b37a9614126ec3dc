use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::SourceError;
use crate::models::{Student, StudentId, StudentSummary};
use crate::source::{read_roster_csv, DataSource};

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<usize> {
    let students = vec![
        Student {
            id: 1,
            name: "Ana Souza".to_string(),
            age: 20,
            grades: vec![8.5, 9.0, 7.5],
            attendance: vec![true, true, true, false],
        },
        Student {
            id: 2,
            name: "Bruno Lima".to_string(),
            age: 22,
            grades: vec![5.0, 6.5],
            attendance: vec![true, false, false, true],
        },
        Student {
            id: 3,
            name: "Carla Mendes".to_string(),
            age: 19,
            grades: vec![],
            attendance: vec![true],
        },
    ];

    let mut written = 0usize;
    for student in &students {
        written += upsert_student(pool, student).await?;
    }
    sync_id_sequence(pool).await?;

    Ok(written)
}

pub async fn import_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let students = read_roster_csv(csv_path)?;
    let mut written = 0usize;

    for student in &students {
        written += upsert_student(pool, student)
            .await
            .with_context(|| format!("failed to import student {}", student.id))?;
    }
    sync_id_sequence(pool).await?;

    Ok(written)
}

async fn upsert_student(pool: &PgPool, student: &Student) -> anyhow::Result<usize> {
    let result = sqlx::query(
        r#"
        INSERT INTO roster.students (id, full_name, age, grades, attendance)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            age = EXCLUDED.age,
            grades = EXCLUDED.grades,
            attendance = EXCLUDED.attendance,
            updated_at = now()
        "#,
    )
    .bind(student.id)
    .bind(&student.name)
    .bind(age_column(student.age)?)
    .bind(&student.grades)
    .bind(&student.attendance)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}

/// Explicit ids bypass the serial sequence, so move it past the highest id.
async fn sync_id_sequence(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        "SELECT setval(pg_get_serial_sequence('roster.students', 'id'), \
         COALESCE((SELECT MAX(id) FROM roster.students), 0) + 1, false)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn age_column(age: u32) -> anyhow::Result<i32> {
    i32::try_from(age).with_context(|| format!("age {age} does not fit the age column"))
}

fn read_age(row: &PgRow) -> Result<u32, SourceError> {
    let age: i32 = row.try_get("age")?;
    u32::try_from(age).map_err(|_| SourceError::Decode(format!("negative age {age}")))
}

pub struct PgDataSource {
    pool: PgPool,
}

impl PgDataSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for PgDataSource {
    async fn fetch_all(&self) -> Result<Vec<StudentSummary>, SourceError> {
        let rows = sqlx::query("SELECT id, full_name, age FROM roster.students ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            summaries.push(StudentSummary {
                id: row.try_get("id")?,
                name: row.try_get("full_name")?,
                age: read_age(&row)?,
            });
        }
        Ok(summaries)
    }

    async fn fetch_by_id(&self, id: StudentId) -> Result<Option<Student>, SourceError> {
        let row = sqlx::query(
            "SELECT id, full_name, age, grades, attendance FROM roster.students WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Student {
            id: row.try_get("id")?,
            name: row.try_get("full_name")?,
            age: read_age(&row)?,
            grades: row.try_get("grades")?,
            attendance: row.try_get("attendance")?,
        }))
    }

    async fn create(&self, student: &Student) -> Result<(), SourceError> {
        let age = age_column(student.age).map_err(|e| SourceError::Rejected(e.to_string()))?;
        let query = if student.id > 0 {
            sqlx::query(
                "INSERT INTO roster.students (id, full_name, age, grades, attendance) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(student.id)
        } else {
            sqlx::query(
                "INSERT INTO roster.students (full_name, age, grades, attendance) \
                 VALUES ($1, $2, $3, $4)",
            )
        };

        query
            .bind(&student.name)
            .bind(age)
            .bind(&student.grades)
            .bind(&student.attendance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace(&self, student: &Student) -> Result<(), SourceError> {
        let age = age_column(student.age).map_err(|e| SourceError::Rejected(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE roster.students
            SET full_name = $2, age = $3, grades = $4, attendance = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(student.id)
        .bind(&student.name)
        .bind(age)
        .bind(&student.grades)
        .bind(&student.attendance)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SourceError::Rejected(format!(
                "student {} does not exist",
                student.id
            )));
        }
        Ok(())
    }

    async fn delete(&self, id: StudentId) -> Result<(), SourceError> {
        let result = sqlx::query("DELETE FROM roster.students WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SourceError::Rejected(format!("student {id} does not exist")));
        }
        Ok(())
    }
}
