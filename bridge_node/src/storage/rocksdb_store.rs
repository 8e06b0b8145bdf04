use super::{
    BundleMember, BundleQuery, DealBundle, DealQuery, LockPaymentEvent, LockPaymentStatus, OfflineDeal,
    SendDealStatus, SourceFile, SourceFileBundleMap, StateStore, StoreError, StoreResult, UnlockPaymentEvent,
    UnlockStatus,
};
use crate::common::now_millis;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

const CF_SOURCE_FILES: &str = "source_files";
const CF_BUNDLES: &str = "bundles";
const CF_BUNDLE_MAPS: &str = "bundle_maps";
const CF_LOCK_EVENTS: &str = "lock_events";
const CF_OFFLINE_DEALS: &str = "offline_deals";
const CF_DEAL_INDEX: &str = "deal_index";
const CF_UNLOCK_EVENTS: &str = "unlock_events";
const CF_META: &str = "meta";

const SEQUENCE_KEY: &[u8] = b"sequence";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_SOURCE_FILES,
    CF_BUNDLES,
    CF_BUNDLE_MAPS,
    CF_LOCK_EVENTS,
    CF_OFFLINE_DEALS,
    CF_DEAL_INDEX,
    CF_UNLOCK_EVENTS,
    CF_META,
];

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::InvalidData(format!("Failed to serialize record: {e}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::InvalidData(format!("Failed to deserialize record: {e}")))
}

/// RocksDB-backed state store, one column family per record type
pub struct RocksDbStore {
    db: Arc<DB>,
    /// Serialises read-modify-write sequences; reads go straight to the DB.
    write_lock: Mutex<()>,
}

impl RocksDbStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut cf_descriptors = vec![ColumnFamilyDescriptor::new("default", Options::default())];
        cf_descriptors.extend(
            COLUMN_FAMILIES
                .iter()
                .map(|name| ColumnFamilyDescriptor::new(*name, Options::default())),
        );

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::ReadError(format!("Failed to open RocksDB: {e}")))?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn get_record<T: DeserializeOwned>(&self, cf_name: &str, id: u64) -> StoreResult<Option<T>> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ReadError(format!("{cf_name} column family not found")))?;
        match self
            .db
            .get_cf(&cf, key(id))
            .map_err(|e| StoreError::ReadError(format!("Failed to read {cf_name}/{id}: {e}")))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> StoreResult<Vec<T>> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ReadError(format!("{cf_name} column family not found")))?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::ReadError(format!("DB iteration error: {e}")))?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    fn put_record<T: Serialize>(&self, batch: &mut WriteBatch, cf_name: &str, id: u64, value: &T) -> StoreResult<()> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::WriteError(format!("{cf_name} column family not found")))?;
        batch.put_cf(&cf, key(id), encode(value)?);
        Ok(())
    }

    /// Reserve the next id. Caller must hold `write_lock` and commit `batch`.
    fn next_id(&self, batch: &mut WriteBatch, reserved: &mut u64) -> StoreResult<u64> {
        let cf = self
            .db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::WriteError("meta column family not found".to_string()))?;
        if *reserved == 0 {
            *reserved = match self
                .db
                .get_cf(&cf, SEQUENCE_KEY)
                .map_err(|e| StoreError::ReadError(format!("Failed to read id sequence: {e}")))?
            {
                Some(bytes) => {
                    let raw: [u8; 8] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StoreError::InvalidData("Corrupt id sequence".to_string()))?;
                    u64::from_be_bytes(raw)
                }
                None => 0,
            };
        }
        *reserved += 1;
        batch.put_cf(&cf, SEQUENCE_KEY, reserved.to_be_bytes());
        Ok(*reserved)
    }

    fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        self.db
            .write(batch)
            .map_err(|e| StoreError::WriteError(format!("Failed to commit batch: {e}")))
    }

    fn bundle_maps(&self) -> StoreResult<Vec<SourceFileBundleMap>> {
        self.scan(CF_BUNDLE_MAPS)
    }

    fn update_bundle<F>(&self, bundle_id: u64, mutate: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut DealBundle) -> bool,
    {
        let _guard = self.write_lock.lock();
        let mut bundle: DealBundle = self
            .get_record(CF_BUNDLES, bundle_id)?
            .ok_or_else(|| StoreError::NotFound(format!("bundle {bundle_id}")))?;
        if !mutate(&mut bundle) {
            return Ok(false);
        }
        bundle.updated_at = now_millis();
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, CF_BUNDLES, bundle_id, &bundle)?;
        self.commit(batch)?;
        Ok(true)
    }
}

#[async_trait]
impl StateStore for RocksDbStore {
    async fn insert_source_file(&self, mut file: SourceFile) -> StoreResult<SourceFile> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut seq = 0;
        file.id = self.next_id(&mut batch, &mut seq)?;
        self.put_record(&mut batch, CF_SOURCE_FILES, file.id, &file)?;
        self.commit(batch)?;
        Ok(file)
    }

    async fn get_source_file(&self, id: u64) -> StoreResult<Option<SourceFile>> {
        self.get_record(CF_SOURCE_FILES, id)
    }

    async fn unbundled_source_files(&self, source_dir: &Path) -> StoreResult<Vec<SourceFile>> {
        let files: Vec<SourceFile> = self.scan(CF_SOURCE_FILES)?;
        let mut pending = Vec::new();
        for file in files.into_iter().filter(|f| f.source_dir == source_dir) {
            if self.get_record::<SourceFileBundleMap>(CF_BUNDLE_MAPS, file.id)?.is_none() {
                pending.push(file);
            }
        }
        Ok(pending)
    }

    async fn source_files_by_bundle(&self, bundle_id: u64) -> StoreResult<Vec<SourceFile>> {
        let mut maps: Vec<SourceFileBundleMap> =
            self.bundle_maps()?.into_iter().filter(|m| m.bundle_id == bundle_id).collect();
        maps.sort_by_key(|m| m.file_index);
        let mut files = Vec::with_capacity(maps.len());
        for map in maps {
            if let Some(file) = self.get_record(CF_SOURCE_FILES, map.source_file_id)? {
                files.push(file);
            }
        }
        Ok(files)
    }

    async fn source_files_by_content_id(&self, content_id: &str) -> StoreResult<Vec<SourceFile>> {
        let files: Vec<SourceFile> = self.scan(CF_SOURCE_FILES)?;
        Ok(files
            .into_iter()
            .filter(|f| f.content_id.as_deref() == Some(content_id))
            .collect())
    }

    async fn bundle_id_for_source_file(&self, source_file_id: u64) -> StoreResult<Option<u64>> {
        Ok(self
            .get_record::<SourceFileBundleMap>(CF_BUNDLE_MAPS, source_file_id)?
            .map(|m| m.bundle_id))
    }

    async fn create_bundle(&self, mut bundle: DealBundle, members: &[BundleMember]) -> StoreResult<DealBundle> {
        if members.is_empty() {
            return Err(StoreError::InvalidData("bundle without source files".to_string()));
        }
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut seq = 0;
        bundle.id = self.next_id(&mut batch, &mut seq)?;

        for (index, member) in members.iter().enumerate() {
            let mut file: SourceFile = self
                .get_record(CF_SOURCE_FILES, member.source_file_id)?
                .ok_or_else(|| StoreError::NotFound(format!("source file {}", member.source_file_id)))?;
            if let Some(existing) = self.get_record::<SourceFileBundleMap>(CF_BUNDLE_MAPS, file.id)? {
                // Dropping the batch discards everything staged so far.
                return Err(StoreError::Conflict(format!(
                    "source file {} already in bundle {}",
                    file.id, existing.bundle_id
                )));
            }
            let map = SourceFileBundleMap {
                source_file_id: file.id,
                bundle_id: bundle.id,
                file_index: index as u32,
                created_at: bundle.created_at,
            };
            self.put_record(&mut batch, CF_BUNDLE_MAPS, file.id, &map)?;
            if file.content_id.is_none() && member.content_id.is_some() {
                file.content_id = member.content_id.clone();
                self.put_record(&mut batch, CF_SOURCE_FILES, file.id, &file)?;
            }
        }

        self.put_record(&mut batch, CF_BUNDLES, bundle.id, &bundle)?;
        self.commit(batch)?;
        debug!("Bundle {} committed with {} files", bundle.id, members.len());
        Ok(bundle)
    }

    async fn get_bundle(&self, id: u64) -> StoreResult<Option<DealBundle>> {
        self.get_record(CF_BUNDLES, id)
    }

    async fn find_bundles(&self, query: &BundleQuery) -> StoreResult<Vec<DealBundle>> {
        let bundles: Vec<DealBundle> = self.scan(CF_BUNDLES)?;
        Ok(query.apply(bundles))
    }

    async fn assign_task_id(&self, bundle_id: u64, task_id: &str) -> StoreResult<bool> {
        self.update_bundle(bundle_id, |bundle| {
            if bundle.has_task() {
                return false;
            }
            bundle.task_id = Some(task_id.to_string());
            true
        })
    }

    async fn record_send_deal_outcome(&self, bundle_id: u64, outcome: SendDealStatus) -> StoreResult<bool> {
        if outcome == SendDealStatus::Empty {
            return Ok(false);
        }
        self.update_bundle(bundle_id, |bundle| {
            if bundle.send_deal_status != SendDealStatus::Empty
                || bundle.lock_payment_status != LockPaymentStatus::Success
            {
                return false;
            }
            bundle.send_deal_status = outcome;
            true
        })
    }

    async fn transition_lock_payment_status(
        &self,
        bundle_id: u64,
        from: LockPaymentStatus,
        to: LockPaymentStatus,
    ) -> StoreResult<bool> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidData(format!("illegal lock status move {from} -> {to}")));
        }
        self.update_bundle(bundle_id, |bundle| {
            if bundle.lock_payment_status != from {
                return false;
            }
            bundle.lock_payment_status = to;
            true
        })
    }

    async fn insert_lock_payment_event(&self, mut event: LockPaymentEvent) -> StoreResult<LockPaymentEvent> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut seq = 0;
        event.id = self.next_id(&mut batch, &mut seq)?;
        self.put_record(&mut batch, CF_LOCK_EVENTS, event.id, &event)?;
        self.commit(batch)?;
        Ok(event)
    }

    async fn lock_payment_events_by_wallet(&self, wallet: &str) -> StoreResult<Vec<LockPaymentEvent>> {
        let events: Vec<LockPaymentEvent> = self.scan(CF_LOCK_EVENTS)?;
        Ok(events
            .into_iter()
            .filter(|e| e.address_from.eq_ignore_ascii_case(wallet))
            .collect())
    }

    async fn lock_payment_events_by_content_id(&self, content_id: &str) -> StoreResult<Vec<LockPaymentEvent>> {
        let events: Vec<LockPaymentEvent> = self.scan(CF_LOCK_EVENTS)?;
        Ok(events.into_iter().filter(|e| e.content_id == content_id).collect())
    }

    async fn claim_lock_payment_event(&self, event_id: u64, source_file_id: u64) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let mut event: LockPaymentEvent = self
            .get_record(CF_LOCK_EVENTS, event_id)?
            .ok_or_else(|| StoreError::NotFound(format!("lock event {event_id}")))?;
        if event.source_file_id.is_some() {
            return Ok(false);
        }
        event.source_file_id = Some(source_file_id);
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, CF_LOCK_EVENTS, event_id, &event)?;
        self.commit(batch)?;
        Ok(true)
    }

    async fn insert_offline_deal(&self, mut deal: OfflineDeal) -> StoreResult<Option<OfflineDeal>> {
        let _guard = self.write_lock.lock();
        if self.get_record::<u64>(CF_DEAL_INDEX, deal.deal_id)?.is_some() {
            return Ok(None);
        }
        let mut batch = WriteBatch::default();
        let mut seq = 0;
        deal.id = self.next_id(&mut batch, &mut seq)?;
        self.put_record(&mut batch, CF_OFFLINE_DEALS, deal.id, &deal)?;
        self.put_record(&mut batch, CF_DEAL_INDEX, deal.deal_id, &deal.id)?;
        self.commit(batch)?;
        Ok(Some(deal))
    }

    async fn find_offline_deals(&self, query: &DealQuery) -> StoreResult<Vec<OfflineDeal>> {
        let deals: Vec<OfflineDeal> = self.scan(CF_OFFLINE_DEALS)?;
        Ok(deals.into_iter().filter(|d| query.matches(d)).collect())
    }

    async fn mark_offline_deal_unlocked(&self, id: u64) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let mut deal: OfflineDeal = self
            .get_record(CF_OFFLINE_DEALS, id)?
            .ok_or_else(|| StoreError::NotFound(format!("offline deal {id}")))?;
        if deal.unlock_status == UnlockStatus::Unlocked {
            return Ok(false);
        }
        deal.unlock_status = UnlockStatus::Unlocked;
        deal.updated_at = now_millis();
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, CF_OFFLINE_DEALS, id, &deal)?;
        self.commit(batch)?;
        Ok(true)
    }

    async fn insert_unlock_payment_events(&self, events: Vec<UnlockPaymentEvent>) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        let mut seq = 0;
        for mut event in events {
            event.id = self.next_id(&mut batch, &mut seq)?;
            self.put_record(&mut batch, CF_UNLOCK_EVENTS, event.id, &event)?;
        }
        self.commit(batch)
    }

    async fn unlock_payment_events_by_deal(&self, deal_id: u64) -> StoreResult<Vec<UnlockPaymentEvent>> {
        let events: Vec<UnlockPaymentEvent> = self.scan(CF_UNLOCK_EVENTS)?;
        Ok(events.into_iter().filter(|e| e.deal_id == deal_id).collect())
    }
}
