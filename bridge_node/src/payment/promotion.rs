//! WAITING to SUCCESS promotion of bundles whose files are all paid for.
//!
//! A member file counts as paid only by a lock event of its own: one already
//! attached to it, or an unattached event for its content id made by the
//! wallet that uploaded it. Unattached events are claimed as they are used,
//! so one deposit never pays for two files.

use crate::common::Result;
use crate::storage::{LockPaymentStatus, SourceFile, StateStore};
use log::{debug, info};

/// Promote `bundle_id` when every member file is paid for. Returns the id
/// when this call moved the bundle.
pub async fn promote_if_paid(store: &dyn StateStore, bundle_id: u64) -> Result<Option<u64>> {
    match store.get_bundle(bundle_id).await? {
        Some(bundle) if bundle.lock_payment_status == LockPaymentStatus::Waiting => {}
        _ => return Ok(None),
    }

    let members = store.source_files_by_bundle(bundle_id).await?;
    if members.is_empty() {
        return Ok(None);
    }
    for member in &members {
        if !is_paid(store, member).await? {
            debug!("Bundle {} waits on payment for source file {}", bundle_id, member.id);
            return Ok(None);
        }
    }

    if store
        .transition_lock_payment_status(bundle_id, LockPaymentStatus::Waiting, LockPaymentStatus::Success)
        .await?
    {
        info!("Bundle {} fully paid, escrow locked", bundle_id);
        Ok(Some(bundle_id))
    } else {
        Ok(None)
    }
}

async fn is_paid(store: &dyn StateStore, file: &SourceFile) -> Result<bool> {
    let content_id = match file.content_id.as_deref() {
        Some(content_id) => content_id,
        None => return Ok(false),
    };
    let events = store.lock_payment_events_by_content_id(content_id).await?;
    if events.iter().any(|e| e.source_file_id == Some(file.id)) {
        return Ok(true);
    }

    for event in events
        .iter()
        .filter(|e| e.source_file_id.is_none() && e.address_from.eq_ignore_ascii_case(&file.wallet_address))
    {
        if store.claim_lock_payment_event(event.id, file.id).await? {
            debug!("Lock event {} attached to source file {}", event.id, file.id);
            return Ok(true);
        }
    }
    Ok(false)
}
