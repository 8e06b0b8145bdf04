//! Scripted gateways and fixtures shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use parking_lot::Mutex;
use payment_bridge::archiver::{ArchiveDescriptor, ArchiveError, Archiver, PackArchiver};
use payment_bridge::chain::escrow_abi::unlock_event_log;
use payment_bridge::chain::{
    ChainError, ChainGateway, ChainResult, Credential, EscrowSession, LockPaymentCall, TxReceipt, UnlockEventLog,
};
use payment_bridge::marketplace::{
    DealSubmission, MarketplaceError, MarketplaceGateway, MarketplaceResult, TaskDeal, TaskInfo, TaskStatus,
};
use payment_bridge::storage::{
    BundleMember, DealBundle, LockPaymentStatus, MemoryStore, SendDealStatus, SourceFile, StateStore,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

// ---------------------------------------------------------------------------
// Chain

#[derive(Default)]
struct ChainState {
    available: HashSet<String>,
    reverting_unlocks: HashSet<String>,
    refund_error: bool,
    refund_reverts: bool,
    lock_reverts: bool,
    lock_unconfirmed: bool,
    session_error: bool,
    unlock_delay: Option<Duration>,
    unlock_calls: Vec<String>,
    refund_calls: Vec<Vec<String>>,
    lock_calls: Vec<LockPaymentCall>,
    receipts: HashMap<H256, TxReceipt>,
    next_tx: u64,
}

/// In-process escrow: records every call and answers from a script
#[derive(Clone)]
pub struct MockChain {
    escrow: Address,
    recipient: Address,
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            escrow: Address::repeat_byte(0xe5),
            recipient: Address::repeat_byte(0x7e),
            state: Arc::new(Mutex::new(ChainState::default())),
        }
    }

    pub fn make_available(&self, deal_id: u64) {
        self.state.lock().available.insert(deal_id.to_string());
    }

    pub fn revert_unlock(&self, deal_id: u64) {
        self.state.lock().reverting_unlocks.insert(deal_id.to_string());
    }

    pub fn fail_refunds(&self) {
        self.state.lock().refund_error = true;
    }

    pub fn revert_refunds(&self) {
        self.state.lock().refund_reverts = true;
    }

    pub fn revert_locks(&self) {
        self.state.lock().lock_reverts = true;
    }

    pub fn leave_locks_unconfirmed(&self) {
        self.state.lock().lock_unconfirmed = true;
    }

    pub fn fail_sessions(&self) {
        self.state.lock().session_error = true;
    }

    pub fn delay_unlocks(&self, delay: Duration) {
        self.state.lock().unlock_delay = Some(delay);
    }

    pub fn unlock_calls(&self) -> Vec<String> {
        self.state.lock().unlock_calls.clone()
    }

    pub fn refund_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().refund_calls.clone()
    }

    pub fn lock_calls(&self) -> Vec<LockPaymentCall> {
        self.state.lock().lock_calls.clone()
    }

    fn issue_tx(&self, success: bool, logs: Vec<payment_bridge::chain::TxLog>, confirm: bool) -> H256 {
        let mut state = self.state.lock();
        state.next_tx += 1;
        let block = state.next_tx;
        let tx_hash = H256::from_low_u64_be(block);
        if confirm {
            state.receipts.insert(
                tx_hash,
                TxReceipt {
                    tx_hash,
                    success,
                    block_number: Some(block),
                    logs,
                },
            );
        }
        tx_hash
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    async fn open_session(&self) -> ChainResult<Arc<dyn EscrowSession>> {
        if self.state.lock().session_error {
            return Err(ChainError::Credential("no operator key configured".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }

    async fn lock_payment(
        &self,
        _depositor: Address,
        _credential: &Credential,
        call: &LockPaymentCall,
    ) -> ChainResult<H256> {
        let (success, confirm) = {
            let mut state = self.state.lock();
            state.lock_calls.push(call.clone());
            (!state.lock_reverts, !state.lock_unconfirmed)
        };
        Ok(self.issue_tx(success, Vec::new(), confirm))
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> ChainResult<TxReceipt> {
        self.state
            .lock()
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or(ChainError::Timeout {
                operation: "wait_for_receipt",
                after: Duration::from_secs(1),
            })
    }
}

#[async_trait]
impl EscrowSession for MockChain {
    fn recipient(&self) -> Address {
        self.recipient
    }

    fn escrow(&self) -> Address {
        self.escrow
    }

    async fn is_payment_available(&self, deal_id: &str, _recipient: Address) -> ChainResult<bool> {
        Ok(self.state.lock().available.contains(deal_id))
    }

    async fn unlock_payment(&self, deal_id: &str, recipient: Address) -> ChainResult<H256> {
        let (delay, reverts) = {
            let mut state = self.state.lock();
            state.unlock_calls.push(deal_id.to_string());
            (state.unlock_delay, state.reverting_unlocks.contains(deal_id))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let log = unlock_event_log(
            self.escrow,
            &UnlockEventLog {
                deal_id: deal_id.to_string(),
                amount: U256::from(250u64),
                recipient,
            },
        );
        Ok(self.issue_tx(!reverts, vec![log], true))
    }

    async fn refund(&self, content_ids: &[String]) -> ChainResult<H256> {
        let (error, reverts) = {
            let mut state = self.state.lock();
            state.refund_calls.push(content_ids.to_vec());
            (state.refund_error, state.refund_reverts)
        };
        if error {
            return Err(ChainError::Rpc("connection reset".to_string()));
        }
        Ok(self.issue_tx(!reverts, Vec::new(), true))
    }
}

// ---------------------------------------------------------------------------
// Marketplace

#[derive(Debug, Clone, Copy)]
pub enum SubmitFailure {
    Rejected,
    Timeout,
}

#[derive(Default)]
struct MarketState {
    statuses: HashMap<String, TaskStatus>,
    deals: HashMap<String, Vec<TaskDeal>>,
    submit_failures: HashMap<u64, SubmitFailure>,
    submitted: Vec<u64>,
    created: Vec<u64>,
    next_task: u64,
    status_error: bool,
}

#[derive(Clone, Default)]
pub struct MockMarketplace {
    state: Arc<Mutex<MarketState>>,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) {
        self.state.lock().statuses.insert(task_id.to_string(), status);
    }

    pub fn fail_submission(&self, bundle_id: u64, failure: SubmitFailure) {
        self.state.lock().submit_failures.insert(bundle_id, failure);
    }

    pub fn fail_status_queries(&self) {
        self.state.lock().status_error = true;
    }

    pub fn add_deal(&self, task_id: &str, id: u64, deal_id: Option<u64>) {
        self.state.lock().deals.entry(task_id.to_string()).or_default().push(TaskDeal {
            id,
            deal_id,
            deal_cid: None,
            payload_cid: None,
            piece_cid: None,
            miner_id: Some("f01234".to_string()),
            status: Some("Active".to_string()),
        });
    }

    pub fn submitted(&self) -> Vec<u64> {
        self.state.lock().submitted.clone()
    }

    pub fn created_tasks(&self) -> Vec<u64> {
        self.state.lock().created.clone()
    }
}

#[async_trait]
impl MarketplaceGateway for MockMarketplace {
    async fn get_task_status(&self, task_id: &str) -> MarketplaceResult<TaskInfo> {
        let state = self.state.lock();
        if state.status_error {
            return Err(MarketplaceError::Http("connection refused".to_string()));
        }
        Ok(TaskInfo {
            uuid: task_id.to_string(),
            status: state.statuses.get(task_id).cloned().unwrap_or(TaskStatus::Created),
            deals: state.deals.get(task_id).cloned().unwrap_or_default(),
        })
    }

    async fn submit_deal(&self, bundle: &DealBundle) -> MarketplaceResult<DealSubmission> {
        let mut state = self.state.lock();
        match state.submit_failures.get(&bundle.id) {
            Some(SubmitFailure::Rejected) => Err(MarketplaceError::Api {
                status: 400,
                message: "no provider accepts this deal".to_string(),
            }),
            Some(SubmitFailure::Timeout) => Err(MarketplaceError::Timeout(Duration::from_secs(30))),
            None => {
                state.submitted.push(bundle.id);
                Ok(DealSubmission {
                    sent_count: 1,
                    report_path: format!("/reports/{}.csv", bundle.id),
                    archives: Vec::new(),
                })
            }
        }
    }

    async fn create_task(&self, bundle: &DealBundle) -> MarketplaceResult<String> {
        let mut state = self.state.lock();
        state.next_task += 1;
        state.created.push(bundle.id);
        Ok(format!("task-{}", state.next_task))
    }
}

// ---------------------------------------------------------------------------
// Archiver

/// Real packing with a call counter, an optional forced failure and an
/// optional rewrite of the entry names
#[derive(Default)]
pub struct CountingArchiver {
    inner: PackArchiver,
    calls: AtomicUsize,
    fail: bool,
    rename: bool,
}

impl CountingArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Packs normally but reports entries under names it made up.
    pub fn renaming() -> Self {
        Self {
            rename: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Archiver for CountingArchiver {
    async fn bundle(&self, source_dir: &Path, out_dir: &Path) -> Result<ArchiveDescriptor, ArchiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ArchiveError::Task("packer crashed".to_string()));
        }
        let mut archive = self.inner.bundle(source_dir, out_dir).await?;
        if self.rename {
            for entry in &mut archive.entries {
                entry.file_name = format!("entry-{}", entry.file_name.len());
            }
        }
        Ok(archive)
    }
}

// ---------------------------------------------------------------------------
// Fixtures

pub fn source_file(dir: &Path, name: &str, size: u64) -> SourceFile {
    SourceFile {
        id: 0,
        content_id: None,
        wallet_address: "0x00000000000000000000000000000000000000aa".to_string(),
        file_name: name.to_string(),
        file_path: dir.join(name),
        source_dir: dir.to_path_buf(),
        file_size: size,
        created_at: 1_700_000_000_000,
    }
}

/// Store a bundle over `file_count` fresh source files and force its statuses.
pub async fn seed_bundle(
    store: &MemoryStore,
    file_count: usize,
    lock: LockPaymentStatus,
    send: SendDealStatus,
    task_id: Option<&str>,
) -> (DealBundle, Vec<SourceFile>) {
    let dir = PathBuf::from("/uploads/seed");
    let mut members = Vec::new();
    for i in 0..file_count {
        let file = store
            .insert_source_file(source_file(&dir, &format!("file-{i}.bin"), 2048))
            .await
            .unwrap();
        members.push(BundleMember {
            source_file_id: file.id,
            content_id: Some(format!("b3:file-{}", file.id)),
        });
    }

    let bundle = DealBundle {
        id: 0,
        archive_name: "seed.car".to_string(),
        archive_path: PathBuf::from("/deals/seed.car"),
        archive_size: 4096,
        archive_md5: "00".repeat(16),
        content_id: "b3:seed".to_string(),
        piece_id: "sha256:seed".to_string(),
        duration: 500,
        lock_payment_status: LockPaymentStatus::Waiting,
        send_deal_status: SendDealStatus::Empty,
        task_id: None,
        is_deleted: false,
        created_at: 1_700_000_000_000,
        updated_at: 1_700_000_000_000,
    };
    let mut bundle = store.create_bundle(bundle, &members).await.unwrap();
    bundle.lock_payment_status = lock;
    bundle.send_deal_status = send;
    bundle.task_id = task_id.map(str::to_string);
    store.put_bundle_unchecked(bundle.clone());

    let files = store.source_files_by_bundle(bundle.id).await.unwrap();
    (bundle, files)
}

pub fn credential() -> Credential {
    Credential::parse(TEST_KEY).unwrap()
}
