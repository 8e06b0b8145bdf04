use super::{
    DealSubmission, MarketplaceError, MarketplaceGateway, MarketplaceResult, TaskDeal, TaskInfo, TaskStatus,
};
use crate::common::{current_epoch, EPOCHS_PER_HOUR};
use crate::config::MarketplaceConfig;
use crate::storage::DealBundle;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// `{status, message, data}` wrapper around every marketplace response
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TaskBody {
    uuid: String,
    status: TaskStatus,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    task: TaskBody,
    #[serde(default)]
    deal: Vec<TaskDeal>,
}

#[derive(Debug, Serialize)]
struct ArchiveBody<'a> {
    archive_name: &'a str,
    archive_size: u64,
    md5: &'a str,
    content_id: &'a str,
    piece_id: &'a str,
}

impl<'a> From<&'a DealBundle> for ArchiveBody<'a> {
    fn from(bundle: &'a DealBundle) -> Self {
        ArchiveBody {
            archive_name: &bundle.archive_name,
            archive_size: bundle.archive_size,
            md5: &bundle.archive_md5,
            content_id: &bundle.content_id,
            piece_id: &bundle.piece_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct DealRequest<'a> {
    start_epoch: i64,
    duration: u64,
    verified_deal: bool,
    fast_retrieval: bool,
    max_price: &'a str,
    archive: ArchiveBody<'a>,
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    task_name: String,
    archive: ArchiveBody<'a>,
}

/// Marketplace client over its REST API
pub struct HttpMarketplace {
    client: Client,
    config: MarketplaceConfig,
}

impl HttpMarketplace {
    pub fn new(config: MarketplaceConfig) -> MarketplaceResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MarketplaceError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// First epoch a deal submitted now may start at.
    pub fn start_epoch(&self) -> i64 {
        current_epoch() + (self.config.start_epoch_hours as i64 + 1) * EPOCHS_PER_HOUR
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.config.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        match &self.config.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> MarketplaceResult<T> {
        let timeout = self.config.request_timeout();
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                MarketplaceError::Timeout(timeout)
            } else {
                MarketplaceError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MarketplaceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| MarketplaceError::Decode(e.to_string()))?;
        if !envelope.status.eq_ignore_ascii_case("success") {
            return Err(MarketplaceError::Api {
                status: status.as_u16(),
                message: envelope.message.unwrap_or(envelope.status),
            });
        }
        envelope
            .data
            .ok_or_else(|| MarketplaceError::Decode("response carries no data".to_string()))
    }
}

#[async_trait]
impl MarketplaceGateway for HttpMarketplace {
    async fn get_task_status(&self, task_id: &str) -> MarketplaceResult<TaskInfo> {
        let data: TaskData = self.send(self.client.get(self.url(&format!("tasks/{task_id}")))).await?;
        debug!("Task {} is {}", data.task.uuid, data.task.status);
        Ok(TaskInfo {
            uuid: data.task.uuid,
            status: data.task.status,
            deals: data.deal,
        })
    }

    async fn submit_deal(&self, bundle: &DealBundle) -> MarketplaceResult<DealSubmission> {
        let task_id = bundle
            .task_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(MarketplaceError::MissingTask(bundle.id))?;

        let body = DealRequest {
            start_epoch: self.start_epoch(),
            duration: bundle.duration,
            verified_deal: self.config.verified_deal,
            fast_retrieval: self.config.fast_retrieval,
            max_price: &self.config.max_price,
            archive: ArchiveBody::from(bundle),
        };
        let submission: DealSubmission = self
            .send(
                self.client
                    .post(self.url(&format!("tasks/{task_id}/deals")))
                    .json(&body),
            )
            .await?;

        info!(
            "Deal sent for task {}: sent_count={}, report={}",
            task_id, submission.sent_count, submission.report_path
        );
        Ok(submission)
    }

    async fn create_task(&self, bundle: &DealBundle) -> MarketplaceResult<String> {
        let body = CreateTaskRequest {
            task_name: format!("bundle-{}", bundle.id),
            archive: ArchiveBody::from(bundle),
        };
        let data: TaskData = self.send(self.client.post(self.url("tasks")).json(&body)).await?;
        Ok(data.task.uuid)
    }
}
