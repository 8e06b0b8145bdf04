use super::{
    BundleMember, BundleQuery, DealBundle, DealQuery, LockPaymentEvent, LockPaymentStatus, OfflineDeal,
    SendDealStatus, SourceFile, SourceFileBundleMap, StateStore, StoreError, StoreResult, UnlockPaymentEvent,
    UnlockStatus,
};
use crate::common::now_millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Tables {
    next_id: u64,
    source_files: BTreeMap<u64, SourceFile>,
    bundles: BTreeMap<u64, DealBundle>,
    /// Keyed by source file id.
    bundle_maps: HashMap<u64, SourceFileBundleMap>,
    lock_events: BTreeMap<u64, LockPaymentEvent>,
    offline_deals: BTreeMap<u64, OfflineDeal>,
    unlock_events: BTreeMap<u64, UnlockPaymentEvent>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory state store for tests and local runs
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            fail_writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` write operations fail without touching state.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> StoreResult<()> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::WriteError("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    pub fn bundle_count(&self) -> usize {
        self.tables.lock().bundles.len()
    }

    pub fn bundle_map_count(&self) -> usize {
        self.tables.lock().bundle_maps.len()
    }

    /// Overwrite a bundle as-is, bypassing transition checks. Test setup only.
    pub fn put_bundle_unchecked(&self, bundle: DealBundle) {
        let mut tables = self.tables.lock();
        tables.next_id = tables.next_id.max(bundle.id);
        tables.bundles.insert(bundle.id, bundle);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_source_file(&self, mut file: SourceFile) -> StoreResult<SourceFile> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        file.id = tables.next_id();
        tables.source_files.insert(file.id, file.clone());
        Ok(file)
    }

    async fn get_source_file(&self, id: u64) -> StoreResult<Option<SourceFile>> {
        Ok(self.tables.lock().source_files.get(&id).cloned())
    }

    async fn unbundled_source_files(&self, source_dir: &Path) -> StoreResult<Vec<SourceFile>> {
        let tables = self.tables.lock();
        Ok(tables
            .source_files
            .values()
            .filter(|f| f.source_dir == source_dir && !tables.bundle_maps.contains_key(&f.id))
            .cloned()
            .collect())
    }

    async fn source_files_by_bundle(&self, bundle_id: u64) -> StoreResult<Vec<SourceFile>> {
        let tables = self.tables.lock();
        let mut maps: Vec<&SourceFileBundleMap> =
            tables.bundle_maps.values().filter(|m| m.bundle_id == bundle_id).collect();
        maps.sort_by_key(|m| m.file_index);
        Ok(maps
            .into_iter()
            .filter_map(|m| tables.source_files.get(&m.source_file_id).cloned())
            .collect())
    }

    async fn source_files_by_content_id(&self, content_id: &str) -> StoreResult<Vec<SourceFile>> {
        let tables = self.tables.lock();
        Ok(tables
            .source_files
            .values()
            .filter(|f| f.content_id.as_deref() == Some(content_id))
            .cloned()
            .collect())
    }

    async fn bundle_id_for_source_file(&self, source_file_id: u64) -> StoreResult<Option<u64>> {
        Ok(self.tables.lock().bundle_maps.get(&source_file_id).map(|m| m.bundle_id))
    }

    async fn create_bundle(&self, mut bundle: DealBundle, members: &[BundleMember]) -> StoreResult<DealBundle> {
        if members.is_empty() {
            return Err(StoreError::InvalidData("bundle without source files".to_string()));
        }
        self.check_write()?;
        let mut tables = self.tables.lock();

        // Validate the whole transaction before writing anything.
        for member in members {
            if !tables.source_files.contains_key(&member.source_file_id) {
                return Err(StoreError::NotFound(format!("source file {}", member.source_file_id)));
            }
            if let Some(existing) = tables.bundle_maps.get(&member.source_file_id) {
                return Err(StoreError::Conflict(format!(
                    "source file {} already in bundle {}",
                    member.source_file_id, existing.bundle_id
                )));
            }
        }

        bundle.id = tables.next_id();
        let created_at = bundle.created_at;
        for (index, member) in members.iter().enumerate() {
            tables.bundle_maps.insert(
                member.source_file_id,
                SourceFileBundleMap {
                    source_file_id: member.source_file_id,
                    bundle_id: bundle.id,
                    file_index: index as u32,
                    created_at,
                },
            );
            if let Some(file) = tables.source_files.get_mut(&member.source_file_id) {
                if file.content_id.is_none() {
                    file.content_id = member.content_id.clone();
                }
            }
        }
        tables.bundles.insert(bundle.id, bundle.clone());
        Ok(bundle)
    }

    async fn get_bundle(&self, id: u64) -> StoreResult<Option<DealBundle>> {
        Ok(self.tables.lock().bundles.get(&id).cloned())
    }

    async fn find_bundles(&self, query: &BundleQuery) -> StoreResult<Vec<DealBundle>> {
        let tables = self.tables.lock();
        Ok(query.apply(tables.bundles.values().cloned()))
    }

    async fn assign_task_id(&self, bundle_id: u64, task_id: &str) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let bundle = tables
            .bundles
            .get_mut(&bundle_id)
            .ok_or_else(|| StoreError::NotFound(format!("bundle {bundle_id}")))?;
        if bundle.has_task() {
            return Ok(false);
        }
        bundle.task_id = Some(task_id.to_string());
        bundle.updated_at = now_millis();
        Ok(true)
    }

    async fn record_send_deal_outcome(&self, bundle_id: u64, outcome: SendDealStatus) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let bundle = tables
            .bundles
            .get_mut(&bundle_id)
            .ok_or_else(|| StoreError::NotFound(format!("bundle {bundle_id}")))?;
        if outcome == SendDealStatus::Empty
            || bundle.send_deal_status != SendDealStatus::Empty
            || bundle.lock_payment_status != LockPaymentStatus::Success
        {
            return Ok(false);
        }
        bundle.send_deal_status = outcome;
        bundle.updated_at = now_millis();
        Ok(true)
    }

    async fn transition_lock_payment_status(
        &self,
        bundle_id: u64,
        from: LockPaymentStatus,
        to: LockPaymentStatus,
    ) -> StoreResult<bool> {
        self.check_write()?;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidData(format!("illegal lock status move {from} -> {to}")));
        }
        let mut tables = self.tables.lock();
        let bundle = tables
            .bundles
            .get_mut(&bundle_id)
            .ok_or_else(|| StoreError::NotFound(format!("bundle {bundle_id}")))?;
        if bundle.lock_payment_status != from {
            return Ok(false);
        }
        bundle.lock_payment_status = to;
        bundle.updated_at = now_millis();
        Ok(true)
    }

    async fn insert_lock_payment_event(&self, mut event: LockPaymentEvent) -> StoreResult<LockPaymentEvent> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        event.id = tables.next_id();
        tables.lock_events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn lock_payment_events_by_wallet(&self, wallet: &str) -> StoreResult<Vec<LockPaymentEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .lock_events
            .values()
            .filter(|e| e.address_from.eq_ignore_ascii_case(wallet))
            .cloned()
            .collect())
    }

    async fn lock_payment_events_by_content_id(&self, content_id: &str) -> StoreResult<Vec<LockPaymentEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .lock_events
            .values()
            .filter(|e| e.content_id == content_id)
            .cloned()
            .collect())
    }

    async fn claim_lock_payment_event(&self, event_id: u64, source_file_id: u64) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let event = tables
            .lock_events
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound(format!("lock event {event_id}")))?;
        if event.source_file_id.is_some() {
            return Ok(false);
        }
        event.source_file_id = Some(source_file_id);
        Ok(true)
    }

    async fn insert_offline_deal(&self, mut deal: OfflineDeal) -> StoreResult<Option<OfflineDeal>> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        if tables.offline_deals.values().any(|d| d.deal_id == deal.deal_id) {
            return Ok(None);
        }
        deal.id = tables.next_id();
        tables.offline_deals.insert(deal.id, deal.clone());
        Ok(Some(deal))
    }

    async fn find_offline_deals(&self, query: &DealQuery) -> StoreResult<Vec<OfflineDeal>> {
        let tables = self.tables.lock();
        Ok(tables.offline_deals.values().filter(|d| query.matches(d)).cloned().collect())
    }

    async fn mark_offline_deal_unlocked(&self, id: u64) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        let deal = tables
            .offline_deals
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("offline deal {id}")))?;
        if deal.unlock_status == UnlockStatus::Unlocked {
            return Ok(false);
        }
        deal.unlock_status = UnlockStatus::Unlocked;
        deal.updated_at = now_millis();
        Ok(true)
    }

    async fn insert_unlock_payment_events(&self, events: Vec<UnlockPaymentEvent>) -> StoreResult<()> {
        self.check_write()?;
        let mut tables = self.tables.lock();
        for mut event in events {
            event.id = tables.next_id();
            tables.unlock_events.insert(event.id, event);
        }
        Ok(())
    }

    async fn unlock_payment_events_by_deal(&self, deal_id: u64) -> StoreResult<Vec<UnlockPaymentEvent>> {
        let tables = self.tables.lock();
        Ok(tables
            .unlock_events
            .values()
            .filter(|e| e.deal_id == deal_id)
            .cloned()
            .collect())
    }
}
