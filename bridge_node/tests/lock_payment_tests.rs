mod common;

use common::{credential, seed_bundle, source_file, MockChain};
use ethers::types::{H256, U256};
use payment_bridge::billing::BillingService;
use payment_bridge::chain::ChainError;
use payment_bridge::common::now_millis;
use payment_bridge::config::BillingConfig;
use payment_bridge::payment::{LockPaymentRequest, LockPaymentService};
use payment_bridge::storage::{
    BundleMember, DealBundle, LockPaymentStatus, MemoryStore, OfflineDeal, SendDealStatus, StateStore,
};
use payment_bridge::BridgeError;
use std::path::Path;
use std::sync::Arc;

const DEPOSITOR: &str = "0x00000000000000000000000000000000000000aa";
const SECOND_DEPOSITOR: &str = "0x00000000000000000000000000000000000000bb";

fn request(content_id: &str, fee: u64) -> LockPaymentRequest {
    LockPaymentRequest {
        depositor: DEPOSITOR.to_string(),
        credential: credential(),
        content_id: content_id.to_string(),
        fee: U256::from(fee),
    }
}

fn request_from(depositor: &str, content_id: &str, fee: u64) -> LockPaymentRequest {
    LockPaymentRequest {
        depositor: depositor.to_string(),
        ..request(content_id, fee)
    }
}

/// Bundle of `wallet`'s files, one per `(name, content id)`.
async fn wallet_bundle(store: &MemoryStore, wallet: &str, files: &[(&str, &str)]) -> DealBundle {
    let dir = Path::new("/uploads/shared");
    let mut members = Vec::new();
    for (name, content_id) in files {
        let mut file = source_file(dir, name, 2048);
        file.wallet_address = wallet.to_string();
        let file = store.insert_source_file(file).await.expect("insert file");
        members.push(BundleMember {
            source_file_id: file.id,
            content_id: Some(content_id.to_string()),
        });
    }
    let bundle = DealBundle {
        id: 0,
        archive_name: format!("{wallet}.car"),
        archive_path: dir.join(format!("{wallet}.car")),
        archive_size: 4096,
        archive_md5: "00".repeat(16),
        content_id: format!("b3:{wallet}"),
        piece_id: format!("sha256:{wallet}"),
        duration: 500,
        lock_payment_status: LockPaymentStatus::Waiting,
        send_deal_status: SendDealStatus::Empty,
        task_id: None,
        is_deleted: false,
        created_at: now_millis(),
        updated_at: now_millis(),
    };
    store.create_bundle(bundle, &members).await.expect("create bundle")
}

async fn lock_status(store: &MemoryStore, bundle_id: u64) -> LockPaymentStatus {
    store
        .get_bundle(bundle_id)
        .await
        .expect("read")
        .expect("bundle")
        .lock_payment_status
}

fn service(store: &Arc<MemoryStore>, chain: &MockChain) -> LockPaymentService {
    LockPaymentService::new(store.clone(), Arc::new(chain.clone()), BillingConfig::default())
}

#[tokio::test]
async fn test_failed_receipt_records_nothing() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let (_, files) = seed_bundle(&store, 1, LockPaymentStatus::Waiting, SendDealStatus::Empty, None).await;
    let content_id = files[0].content_id.clone().expect("content id");
    chain.revert_locks();

    let outcome = service(&store, &chain)
        .lock_payment(request(&content_id, 1_000))
        .await
        .expect("lock call");

    assert!(!outcome.success);
    assert_eq!(outcome.tx_hash, H256::from_low_u64_be(1));
    assert!(outcome.event.is_none());
    assert!(store
        .lock_payment_events_by_content_id(&content_id)
        .await
        .expect("events")
        .is_empty());
}

#[tokio::test]
async fn test_missing_receipt_reports_the_hash() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    chain.leave_locks_unconfirmed();

    let err = service(&store, &chain)
        .lock_payment(request("b3:anything", 10))
        .await
        .unwrap_err();

    match err {
        BridgeError::Unconfirmed { tx_hash, source } => {
            assert_eq!(tx_hash, H256::from_low_u64_be(1));
            assert!(matches!(source, ChainError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.lock_payment_events_by_wallet(DEPOSITOR).await.expect("events").is_empty());
}

#[tokio::test]
async fn test_bad_input_never_reaches_the_chain() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let svc = service(&store, &chain);

    let mut bad_wallet = request("b3:cid", 10);
    bad_wallet.depositor = "0xnot-an-address".to_string();
    assert!(matches!(
        svc.lock_payment(bad_wallet).await.unwrap_err(),
        BridgeError::Chain(ChainError::Address(_))
    ));

    assert!(matches!(
        svc.lock_payment(request("  ", 10)).await.unwrap_err(),
        BridgeError::InvalidInput(_)
    ));
    assert!(chain.lock_calls().is_empty());
}

#[tokio::test]
async fn test_paying_every_file_promotes_the_bundle() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let (bundle, files) = seed_bundle(&store, 2, LockPaymentStatus::Waiting, SendDealStatus::Empty, None).await;
    let svc = service(&store, &chain);
    let first_cid = files[0].content_id.clone().expect("content id");
    let second_cid = files[1].content_id.clone().expect("content id");

    let first = svc.lock_payment(request(&first_cid, 1_000)).await.expect("first lock");
    assert!(first.success);
    assert!(first.promoted_bundle.is_none());
    let event = first.event.expect("event stored");
    assert_eq!(event.source_file_id, Some(files[0].id));
    assert_eq!(event.locked_fee, "1000");
    assert_eq!(event.address_from, DEPOSITOR);
    assert_eq!(event.deadline - event.lock_time, 6 * 86_400_000);
    let current = store.get_bundle(bundle.id).await.expect("read").expect("bundle");
    assert_eq!(current.lock_payment_status, LockPaymentStatus::Waiting);

    let second = svc.lock_payment(request(&second_cid, 2_000)).await.expect("second lock");
    assert_eq!(second.promoted_bundle, Some(bundle.id));
    let current = store.get_bundle(bundle.id).await.expect("read").expect("bundle");
    assert_eq!(current.lock_payment_status, LockPaymentStatus::Success);

    let calls = chain.lock_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].content_id, second_cid);
    assert_eq!(calls[1].amount, U256::from(2_000u64));
}

#[tokio::test]
async fn test_unstored_event_still_reports_success() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let (_, files) = seed_bundle(&store, 1, LockPaymentStatus::Waiting, SendDealStatus::Empty, None).await;
    let content_id = files[0].content_id.clone().expect("content id");
    store.fail_next_writes(1);

    let outcome = service(&store, &chain)
        .lock_payment(request(&content_id, 5))
        .await
        .expect("lock call");

    assert!(outcome.success);
    assert!(outcome.event.is_none());
    assert!(outcome.promoted_bundle.is_none());
}

#[tokio::test]
async fn test_billing_history_follows_the_deposit() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let (bundle, files) = seed_bundle(&store, 2, LockPaymentStatus::Waiting, SendDealStatus::Empty, None).await;
    let svc = service(&store, &chain);
    for (i, file) in files.iter().enumerate() {
        let cid = file.content_id.clone().expect("content id");
        svc.lock_payment(request(&cid, 100 + i as u64)).await.expect("lock");
    }
    store
        .insert_offline_deal(OfflineDeal::new(4242, bundle.id, now_millis()))
        .await
        .expect("deal");

    let billing = BillingService::new(store.clone());
    let history = billing.history(&DEPOSITOR.to_uppercase().replace("0X", "0x"), None, 10, 0).await.expect("history");
    assert_eq!(history.len(), 2);
    assert!(history[0].lock.id > history[1].lock.id || history[0].lock.lock_time > history[1].lock.lock_time);
    assert!(history.iter().all(|r| r.bundle_id == Some(bundle.id)));
    assert!(history
        .iter()
        .all(|r| r.lock_payment_status == Some(LockPaymentStatus::Success)));
    assert!(history.iter().all(|r| r.file_name.is_some()));

    let page = billing.history(DEPOSITOR, None, 1, 1).await.expect("page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].lock.id, history[1].lock.id);

    let tx = history[1].lock.tx_hash.clone();
    let single = billing.history(DEPOSITOR, Some(&tx), 10, 0).await.expect("by tx");
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].lock.tx_hash, tx);

    let status = billing.bundle_status(bundle.id).await.expect("status").expect("bundle");
    assert_eq!(status.files.len(), 2);
    assert_eq!(status.deals.len(), 1);
    assert!(billing.bundle_status(9_999).await.expect("status").is_none());
}

#[tokio::test]
async fn test_deposit_only_pays_for_the_depositors_file() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let svc = service(&store, &chain);
    let first = wallet_bundle(&store, DEPOSITOR, &[("x.bin", "b3:shared")]).await;
    let second = wallet_bundle(&store, SECOND_DEPOSITOR, &[("x.bin", "b3:shared"), ("y.bin", "b3:own")]).await;

    let outcome = svc
        .lock_payment(request_from(DEPOSITOR, "b3:shared", 100))
        .await
        .expect("first depositor lock");
    assert_eq!(outcome.promoted_bundle, Some(first.id));
    let first_file = store.source_files_by_bundle(first.id).await.expect("files")[0].id;
    assert_eq!(outcome.event.expect("event").source_file_id, Some(first_file));

    // The shared content id is paid by someone else; this bundle still waits.
    let outcome = svc
        .lock_payment(request_from(SECOND_DEPOSITOR, "b3:own", 100))
        .await
        .expect("second depositor lock");
    assert!(outcome.promoted_bundle.is_none());
    assert_eq!(lock_status(&store, second.id).await, LockPaymentStatus::Waiting);

    let outcome = svc
        .lock_payment(request_from(SECOND_DEPOSITOR, "b3:shared", 100))
        .await
        .expect("second depositor shared lock");
    assert_eq!(outcome.promoted_bundle, Some(second.id));
    assert_eq!(lock_status(&store, second.id).await, LockPaymentStatus::Success);
}

#[tokio::test]
async fn test_deposit_without_a_file_of_the_depositor_stays_unattached() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let bundle = wallet_bundle(&store, DEPOSITOR, &[("x.bin", "b3:theirs")]).await;

    let outcome = service(&store, &chain)
        .lock_payment(request_from(SECOND_DEPOSITOR, "b3:theirs", 100))
        .await
        .expect("lock");

    assert!(outcome.success);
    assert!(outcome.promoted_bundle.is_none());
    assert_eq!(outcome.event.expect("event").source_file_id, None);
    assert_eq!(lock_status(&store, bundle.id).await, LockPaymentStatus::Waiting);
}

#[tokio::test]
async fn test_one_deposit_pays_for_one_file() {
    let store = Arc::new(MemoryStore::new());
    let chain = MockChain::new();
    let svc = service(&store, &chain);
    let bundle = wallet_bundle(&store, DEPOSITOR, &[("a.bin", "b3:same"), ("b.bin", "b3:same")]).await;

    let first = svc.lock_payment(request("b3:same", 100)).await.expect("first lock");
    assert!(first.promoted_bundle.is_none());
    assert_eq!(lock_status(&store, bundle.id).await, LockPaymentStatus::Waiting);

    let second = svc.lock_payment(request("b3:same", 100)).await.expect("second lock");
    assert_eq!(second.promoted_bundle, Some(bundle.id));
    let owners: Vec<Option<u64>> = store
        .lock_payment_events_by_content_id("b3:same")
        .await
        .expect("events")
        .into_iter()
        .map(|e| e.source_file_id)
        .collect();
    assert_eq!(owners.len(), 2);
    assert_ne!(owners[0], owners[1]);
}
