use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub mod memory;
pub mod records;
pub mod rocksdb_store;

pub use memory::MemoryStore;
pub use records::*;
pub use rocksdb_store::RocksDbStore;

// Storage-specific Result type
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Record store that is the single source of truth for the bridge.
///
/// Single-record status changes are compare-and-set: they name the status
/// the record must currently hold and report whether the move happened.
/// Bundle creation writes the bundle, its file maps and the source files'
/// content ids in one transaction.
#[async_trait]
pub trait StateStore: Send + Sync {
    // Source files
    async fn insert_source_file(&self, file: SourceFile) -> StoreResult<SourceFile>;
    async fn get_source_file(&self, id: u64) -> StoreResult<Option<SourceFile>>;
    /// Files under `source_dir` not yet mapped into any bundle, in id order.
    async fn unbundled_source_files(&self, source_dir: &Path) -> StoreResult<Vec<SourceFile>>;
    /// Files of a bundle in file-index order.
    async fn source_files_by_bundle(&self, bundle_id: u64) -> StoreResult<Vec<SourceFile>>;
    async fn source_files_by_content_id(&self, content_id: &str) -> StoreResult<Vec<SourceFile>>;
    async fn bundle_id_for_source_file(&self, source_file_id: u64) -> StoreResult<Option<u64>>;

    // Deal bundles
    async fn create_bundle(&self, bundle: DealBundle, members: &[BundleMember]) -> StoreResult<DealBundle>;
    async fn get_bundle(&self, id: u64) -> StoreResult<Option<DealBundle>>;
    async fn find_bundles(&self, query: &BundleQuery) -> StoreResult<Vec<DealBundle>>;
    /// Sets the task id of a bundle that has none.
    async fn assign_task_id(&self, bundle_id: u64, task_id: &str) -> StoreResult<bool>;
    /// Moves `sendDealStatus` out of EMPTY, only while the escrow is locked.
    async fn record_send_deal_outcome(&self, bundle_id: u64, outcome: SendDealStatus) -> StoreResult<bool>;
    async fn transition_lock_payment_status(
        &self,
        bundle_id: u64,
        from: LockPaymentStatus,
        to: LockPaymentStatus,
    ) -> StoreResult<bool>;

    // Lock events
    async fn insert_lock_payment_event(&self, event: LockPaymentEvent) -> StoreResult<LockPaymentEvent>;
    async fn lock_payment_events_by_wallet(&self, wallet: &str) -> StoreResult<Vec<LockPaymentEvent>>;
    async fn lock_payment_events_by_content_id(&self, content_id: &str) -> StoreResult<Vec<LockPaymentEvent>>;
    /// Attach an unowned lock event to the source file it pays for. `false`
    /// when the event already belongs to a file.
    async fn claim_lock_payment_event(&self, event_id: u64, source_file_id: u64) -> StoreResult<bool>;

    // Offline deals
    /// Returns `None` when a deal with the same marketplace deal id exists.
    async fn insert_offline_deal(&self, deal: OfflineDeal) -> StoreResult<Option<OfflineDeal>>;
    async fn find_offline_deals(&self, query: &DealQuery) -> StoreResult<Vec<OfflineDeal>>;
    async fn mark_offline_deal_unlocked(&self, id: u64) -> StoreResult<bool>;

    // Unlock events
    async fn insert_unlock_payment_events(&self, events: Vec<UnlockPaymentEvent>) -> StoreResult<()>;
    async fn unlock_payment_events_by_deal(&self, deal_id: u64) -> StoreResult<Vec<UnlockPaymentEvent>>;
}
