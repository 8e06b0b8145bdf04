//! Marketplace Gateway - storage network task and deal API

pub mod http;

use crate::storage::DealBundle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use http::HttpMarketplace;

#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("HTTP failure: {0}")]
    Http(String),

    #[error("Marketplace request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Marketplace rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected marketplace response: {0}")]
    Decode(String),

    #[error("Bundle {0} has no marketplace task")]
    MissingTask(u64),
}

impl MarketplaceError {
    pub fn is_transient(&self) -> bool {
        match self {
            MarketplaceError::Http(_) | MarketplaceError::Timeout(_) => true,
            MarketplaceError::Api { status, .. } => *status >= 500 || *status == 429,
            MarketplaceError::Decode(_) | MarketplaceError::MissingTask(_) => false,
        }
    }
}

pub type MarketplaceResult<T> = std::result::Result<T, MarketplaceError>;

/// Lifecycle state of a marketplace task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Created,
    Assigned,
    ActionRequired,
    DealSent,
    Completed,
    Failed,
    Other(String),
}

impl TaskStatus {
    /// Marketplace casing is not stable, so any casing is accepted.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(|c| c.to_lowercase())
            .collect();
        match normalized.as_str() {
            "created" | "pending" => TaskStatus::Created,
            "assigned" => TaskStatus::Assigned,
            "actionrequired" => TaskStatus::ActionRequired,
            "dealsent" => TaskStatus::DealSent,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Other(raw.trim().to_string()),
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, TaskStatus::Assigned)
    }
}

impl From<String> for TaskStatus {
    fn from(raw: String) -> Self {
        TaskStatus::parse(&raw)
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Created => f.write_str("Created"),
            TaskStatus::Assigned => f.write_str("Assigned"),
            TaskStatus::ActionRequired => f.write_str("ActionRequired"),
            TaskStatus::DealSent => f.write_str("DealSent"),
            TaskStatus::Completed => f.write_str("Completed"),
            TaskStatus::Failed => f.write_str("Failed"),
            TaskStatus::Other(raw) => f.write_str(raw),
        }
    }
}

/// A storage deal the marketplace placed for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeal {
    pub id: u64,
    /// On-chain deal id, present once the provider published the deal.
    #[serde(default)]
    pub deal_id: Option<u64>,
    #[serde(default)]
    pub deal_cid: Option<String>,
    #[serde(default)]
    pub payload_cid: Option<String>,
    #[serde(default)]
    pub piece_cid: Option<String>,
    #[serde(default)]
    pub miner_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub uuid: String,
    pub status: TaskStatus,
    pub deals: Vec<TaskDeal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedArchive {
    pub archive_name: String,
    pub content_id: String,
    #[serde(default)]
    pub piece_id: Option<String>,
    #[serde(default)]
    pub miner_id: Option<String>,
}

/// Result of handing a bundle to the marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealSubmission {
    pub sent_count: u32,
    #[serde(default)]
    pub report_path: String,
    #[serde(default)]
    pub archives: Vec<SubmittedArchive>,
}

#[async_trait]
pub trait MarketplaceGateway: Send + Sync {
    async fn get_task_status(&self, task_id: &str) -> MarketplaceResult<TaskInfo>;

    /// Place the deal for a bundle whose task is assigned.
    async fn submit_deal(&self, bundle: &DealBundle) -> MarketplaceResult<DealSubmission>;

    /// Register a task for a bundle and return its id.
    async fn create_task(&self, bundle: &DealBundle) -> MarketplaceResult<String>;

    /// Deals the marketplace confirmed for a task.
    async fn task_deals(&self, task_id: &str) -> MarketplaceResult<Vec<TaskDeal>> {
        Ok(self.get_task_status(task_id).await?.deals)
    }
}
