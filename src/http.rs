use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::HttpSourceConfig;
use crate::error::SourceError;
use crate::models::{Student, StudentId, StudentSummary};
use crate::source::DataSource;

pub struct HttpDataSource {
    client: Client,
    base_url: String,
}

impl HttpDataSource {
    pub fn new(config: &HttpSourceConfig) -> Result<Self, SourceError> {
        if config.accept_invalid_certs {
            warn!("TLS certificate validation disabled for {}", config.base_url);
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        let mut base_url = config.base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn student_url(&self, id: StudentId) -> String {
        format!("{}{}", self.base_url, id)
    }
}

async fn ensure_success(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Rejected(format!(
        "{} {}",
        status,
        body.chars().take(200).collect::<String>()
    )))
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch_all(&self) -> Result<Vec<StudentSummary>, SourceError> {
        debug!(url = %self.base_url, "fetching roster");
        let response = self.client.get(&self.base_url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn fetch_by_id(&self, id: StudentId) -> Result<Option<Student>, SourceError> {
        let response = self.client.get(self.student_url(id)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn create(&self, student: &Student) -> Result<(), SourceError> {
        let response = self.client.post(&self.base_url).json(student).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn replace(&self, student: &Student) -> Result<(), SourceError> {
        let response = self
            .client
            .put(self.student_url(student.id))
            .json(student)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn delete(&self, id: StudentId) -> Result<(), SourceError> {
        let response = self.client.delete(self.student_url(id)).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}
