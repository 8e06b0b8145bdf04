mod common;

use common::source_file;
use payment_bridge::storage::{
    BundleMember, BundleQuery, DealBundle, DealQuery, LockPaymentEvent, LockPaymentStatus, OfflineDeal,
    RocksDbStore, SendDealStatus, StateStore, StoreError, UnlockPaymentEvent, UnlockStatus,
};
use std::path::{Path, PathBuf};

fn new_bundle(name: &str, created_at: i64) -> DealBundle {
    DealBundle {
        id: 0,
        archive_name: format!("{name}.car"),
        archive_path: PathBuf::from(format!("/deals/{name}.car")),
        archive_size: 4096,
        archive_md5: "ab".repeat(16),
        content_id: format!("b3:{name}"),
        piece_id: format!("sha256:{name}"),
        duration: 500,
        lock_payment_status: LockPaymentStatus::Waiting,
        send_deal_status: SendDealStatus::Empty,
        task_id: None,
        is_deleted: false,
        created_at,
        updated_at: created_at,
    }
}

async fn bundle_two_files(store: &RocksDbStore, dir: &Path, name: &str, created_at: i64) -> DealBundle {
    let a = store
        .insert_source_file(source_file(dir, &format!("{name}-a.bin"), 1024))
        .await
        .expect("insert a");
    let b = store
        .insert_source_file(source_file(dir, &format!("{name}-b.bin"), 1024))
        .await
        .expect("insert b");
    let members = [
        BundleMember {
            source_file_id: a.id,
            content_id: Some(format!("b3:{name}-a")),
        },
        BundleMember {
            source_file_id: b.id,
            content_id: Some(format!("b3:{name}-b")),
        },
    ];
    store
        .create_bundle(new_bundle(name, created_at), &members)
        .await
        .expect("create bundle")
}

#[tokio::test]
async fn test_bundle_survives_reopen() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let uploads = PathBuf::from("/uploads");

    let bundle_id = {
        let store = RocksDbStore::open(temp_dir.path()).expect("open");
        let bundle = bundle_two_files(&store, &uploads, "first", 1_000).await;
        assert!(store.unbundled_source_files(&uploads).await.expect("pending").is_empty());
        bundle.id
    };

    let store = RocksDbStore::open(temp_dir.path()).expect("reopen");
    let bundle = store.get_bundle(bundle_id).await.expect("read").expect("bundle");
    assert_eq!(bundle.archive_name, "first.car");

    let files = store.source_files_by_bundle(bundle_id).await.expect("files");
    let cids: Vec<_> = files.iter().map(|f| f.content_id.clone()).collect();
    assert_eq!(
        cids,
        vec![Some("b3:first-a".to_string()), Some("b3:first-b".to_string())]
    );
    let by_cid = store.source_files_by_content_id("b3:first-b").await.expect("by cid");
    assert_eq!(by_cid.len(), 1);
    assert_eq!(
        store.bundle_id_for_source_file(by_cid[0].id).await.expect("map"),
        Some(bundle_id)
    );

    // Ids keep increasing after a reopen.
    let next = store
        .insert_source_file(source_file(&uploads, "late.bin", 10))
        .await
        .expect("insert");
    assert!(next.id > bundle_id);
}

#[tokio::test]
async fn test_conflicting_bundle_writes_nothing() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = RocksDbStore::open(temp_dir.path()).expect("open");
    let uploads = PathBuf::from("/uploads");
    let first = bundle_two_files(&store, &uploads, "first", 1_000).await;
    let taken = store.source_files_by_bundle(first.id).await.expect("files")[0].clone();
    let fresh = store
        .insert_source_file(source_file(&uploads, "fresh.bin", 10))
        .await
        .expect("insert");

    let members = [
        BundleMember {
            source_file_id: fresh.id,
            content_id: Some("b3:fresh".to_string()),
        },
        BundleMember {
            source_file_id: taken.id,
            content_id: None,
        },
    ];
    let err = store
        .create_bundle(new_bundle("second", 2_000), &members)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let fresh = store.get_source_file(fresh.id).await.expect("read").expect("file");
    assert!(fresh.content_id.is_none());
    assert_eq!(store.bundle_id_for_source_file(fresh.id).await.expect("map"), None);
    assert_eq!(store.find_bundles(&BundleQuery::default()).await.expect("bundles").len(), 1);
}

#[tokio::test]
async fn test_bundle_without_files_is_rejected() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = RocksDbStore::open(temp_dir.path()).expect("open");

    let err = store.create_bundle(new_bundle("empty", 1_000), &[]).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    assert!(store.find_bundles(&BundleQuery::default()).await.expect("bundles").is_empty());
}

#[tokio::test]
async fn test_status_changes_are_compare_and_set() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = RocksDbStore::open(temp_dir.path()).expect("open");
    let bundle = bundle_two_files(&store, Path::new("/uploads"), "cas", 1_000).await;

    // Not locked yet: no submission outcome is accepted.
    assert!(!store
        .record_send_deal_outcome(bundle.id, SendDealStatus::Success)
        .await
        .expect("outcome"));

    assert!(store
        .transition_lock_payment_status(bundle.id, LockPaymentStatus::Waiting, LockPaymentStatus::Success)
        .await
        .expect("lock"));
    assert!(!store
        .transition_lock_payment_status(bundle.id, LockPaymentStatus::Waiting, LockPaymentStatus::Success)
        .await
        .expect("stale lock"));
    assert!(matches!(
        store
            .transition_lock_payment_status(bundle.id, LockPaymentStatus::Waiting, LockPaymentStatus::UnlockRefunded)
            .await,
        Err(StoreError::InvalidData(_))
    ));

    assert!(store.assign_task_id(bundle.id, "task-1").await.expect("task"));
    assert!(!store.assign_task_id(bundle.id, "task-2").await.expect("second task"));

    assert!(!store
        .record_send_deal_outcome(bundle.id, SendDealStatus::Empty)
        .await
        .expect("empty outcome"));
    assert!(store
        .record_send_deal_outcome(bundle.id, SendDealStatus::Fail)
        .await
        .expect("outcome"));
    assert!(!store
        .record_send_deal_outcome(bundle.id, SendDealStatus::Success)
        .await
        .expect("second outcome"));

    let current = store.get_bundle(bundle.id).await.expect("read").expect("bundle");
    assert_eq!(current.task_id.as_deref(), Some("task-1"));
    assert_eq!(current.send_deal_status, SendDealStatus::Fail);
    assert_eq!(current.lock_payment_status, LockPaymentStatus::Success);
    assert!(current.updated_at >= current.created_at);
}

#[tokio::test]
async fn test_bundle_queries_select_by_status() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = RocksDbStore::open(temp_dir.path()).expect("open");
    let uploads = Path::new("/uploads");
    let older = bundle_two_files(&store, uploads, "older", 1_000).await;
    let newer = bundle_two_files(&store, uploads, "newer", 2_000).await;
    let waiting = bundle_two_files(&store, uploads, "waiting", 3_000).await;
    for bundle in [&older, &newer] {
        store
            .transition_lock_payment_status(bundle.id, LockPaymentStatus::Waiting, LockPaymentStatus::Success)
            .await
            .expect("lock");
        store.assign_task_id(bundle.id, "task").await.expect("task");
    }

    let ready = store
        .find_bundles(&BundleQuery::ready_for_submission(10))
        .await
        .expect("ready");
    let ids: Vec<u64> = ready.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);

    let limited = store
        .find_bundles(&BundleQuery::ready_for_submission(1))
        .await
        .expect("ready");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, newer.id);

    assert!(store
        .find_bundles(&BundleQuery::awaiting_task(10))
        .await
        .expect("awaiting")
        .is_empty());
    assert!(!ready.iter().any(|b| b.id == waiting.id));
}

#[tokio::test]
async fn test_offline_deals_and_events() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = RocksDbStore::open(temp_dir.path()).expect("open");
    let bundle = bundle_two_files(&store, Path::new("/uploads"), "deals", 1_000).await;

    let deal = store
        .insert_offline_deal(OfflineDeal::new(77, bundle.id, 1_000))
        .await
        .expect("insert")
        .expect("new deal");
    assert!(store
        .insert_offline_deal(OfflineDeal::new(77, bundle.id, 2_000))
        .await
        .expect("duplicate")
        .is_none());
    store
        .insert_offline_deal(OfflineDeal::new(78, bundle.id, 1_000))
        .await
        .expect("insert");

    assert_eq!(store.find_offline_deals(&DealQuery::to_unlock()).await.expect("deals").len(), 2);
    assert!(store.mark_offline_deal_unlocked(deal.id).await.expect("mark"));
    assert!(!store.mark_offline_deal_unlocked(deal.id).await.expect("mark again"));
    let remaining = store
        .find_offline_deals(&DealQuery::not_unlocked_in_bundle(bundle.id))
        .await
        .expect("remaining");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].deal_id, 78);
    assert_eq!(remaining[0].unlock_status, UnlockStatus::NotUnlocked);

    store
        .insert_unlock_payment_events(vec![UnlockPaymentEvent {
            id: 0,
            tx_hash: "0x01".to_string(),
            deal_id: 77,
            recipient: "0x7e".to_string(),
            amount: "250".to_string(),
            unlock_time: 3_000,
        }])
        .await
        .expect("events");
    assert_eq!(store.unlock_payment_events_by_deal(77).await.expect("events").len(), 1);
    assert!(store.unlock_payment_events_by_deal(78).await.expect("events").is_empty());

    store
        .insert_lock_payment_event(LockPaymentEvent {
            id: 0,
            tx_hash: "0x02".to_string(),
            content_id: "b3:deals-a".to_string(),
            locked_fee: "1000".to_string(),
            coin_id: 1,
            network_id: 1,
            address_from: "0x00000000000000000000000000000000000000aa".to_string(),
            lock_time: 1_000,
            deadline: 2_000,
            source_file_id: None,
        })
        .await
        .expect("lock event");
    let lock_event_id = store
        .lock_payment_events_by_content_id("b3:deals-a")
        .await
        .expect("by cid")[0]
        .id;
    let owner = store.source_files_by_content_id("b3:deals-a").await.expect("files")[0].id;
    assert!(store.claim_lock_payment_event(lock_event_id, owner).await.expect("claim"));
    assert!(!store.claim_lock_payment_event(lock_event_id, owner + 1).await.expect("claim again"));
    assert!(matches!(
        store.claim_lock_payment_event(9_999, owner).await,
        Err(StoreError::NotFound(_))
    ));

    let by_wallet = store
        .lock_payment_events_by_wallet("0x00000000000000000000000000000000000000AA")
        .await
        .expect("by wallet");
    assert_eq!(by_wallet.len(), 1);
    assert_eq!(by_wallet[0].source_file_id, Some(owner));
    assert_eq!(
        store
            .lock_payment_events_by_content_id("b3:deals-a")
            .await
            .expect("by cid")
            .len(),
        1
    );
}
