//! Persistent records shared by the jobs, the lock operation and billing reads.
//!
//! Status values are written in one canonical upper-case form. Parsing is
//! case-insensitive so rows written by older tooling still load.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::archiver::ArchiveDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status value: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_ascii_uppercase();
                $(if normalized == $text {
                    return Ok($name::$variant);
                })+
                Err(UnknownStatus(s.to_string()))
            }
        }
    };
}

status_enum! {
    /// Escrow state of a bundle
    LockPaymentStatus {
        Waiting => "WAITING",
        Success => "SUCCESS",
        UnlockRefunded => "UNLOCK_REFUNDED",
        UnlockRefundFailed => "UNLOCK_REFUND_FAILED",
    }
}

status_enum! {
    /// Marketplace submission state of a bundle
    SendDealStatus {
        Empty => "",
        Success => "SUCCESS",
        Fail => "FAIL",
    }
}

status_enum! {
    UnlockStatus {
        NotUnlocked => "NOT_UNLOCKED",
        Unlocked => "UNLOCKED",
    }
}

impl LockPaymentStatus {
    /// Refund outcomes are final for a bundle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LockPaymentStatus::UnlockRefunded | LockPaymentStatus::UnlockRefundFailed
        )
    }

    /// Allowed forward moves. Nothing leaves a terminal state and nothing
    /// reaches the refund branch without passing through SUCCESS.
    pub fn can_transition_to(&self, next: LockPaymentStatus) -> bool {
        use LockPaymentStatus::*;
        matches!(
            (self, next),
            (Waiting, Success) | (Success, UnlockRefunded) | (Success, UnlockRefundFailed)
        )
    }
}

/// An uploaded file awaiting bundling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: u64,
    /// Assigned by the bundling job together with the bundle mapping.
    pub content_id: Option<String>,
    pub wallet_address: String,
    pub file_name: String,
    pub file_path: PathBuf,
    /// Watched directory the file was uploaded into.
    pub source_dir: PathBuf,
    pub file_size: u64,
    pub created_at: i64,
}

/// One archive submitted to the marketplace as a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealBundle {
    pub id: u64,
    pub archive_name: String,
    pub archive_path: PathBuf,
    pub archive_size: u64,
    pub archive_md5: String,
    pub content_id: String,
    pub piece_id: String,
    /// Deal duration in epochs.
    pub duration: u64,
    pub lock_payment_status: LockPaymentStatus,
    pub send_deal_status: SendDealStatus,
    pub task_id: Option<String>,
    pub is_deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DealBundle {
    pub fn from_archive(archive: &ArchiveDescriptor, duration: u64, now: i64) -> Self {
        Self {
            id: 0,
            archive_name: archive.archive_name.clone(),
            archive_path: archive.archive_path.clone(),
            archive_size: archive.archive_size,
            archive_md5: archive.checksum.clone(),
            content_id: archive.content_id.clone(),
            piece_id: archive.piece_id.clone(),
            duration,
            lock_payment_status: LockPaymentStatus::Waiting,
            send_deal_status: SendDealStatus::Empty,
            task_id: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_task(&self) -> bool {
        self.task_id.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Fixes the order of a source file inside its bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFileBundleMap {
    pub source_file_id: u64,
    pub bundle_id: u64,
    pub file_index: u32,
    pub created_at: i64,
}

/// Source file going into a new bundle, with the content id the archiver
/// computed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleMember {
    pub source_file_id: u64,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockPaymentEvent {
    pub id: u64,
    pub tx_hash: String,
    pub content_id: String,
    /// Fee in the token's smallest unit, decimal.
    pub locked_fee: String,
    pub coin_id: u32,
    pub network_id: u32,
    pub address_from: String,
    pub lock_time: i64,
    pub deadline: i64,
    pub source_file_id: Option<u64>,
}

/// Marketplace-confirmed storage deal for a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineDeal {
    pub id: u64,
    /// Marketplace-assigned deal id; unique across the store.
    pub deal_id: u64,
    pub bundle_id: u64,
    pub unlock_status: UnlockStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OfflineDeal {
    pub fn new(deal_id: u64, bundle_id: u64, now: i64) -> Self {
        Self {
            id: 0,
            deal_id,
            bundle_id,
            unlock_status: UnlockStatus::NotUnlocked,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockPaymentEvent {
    pub id: u64,
    pub tx_hash: String,
    pub deal_id: u64,
    pub recipient: String,
    /// Released amount in the token's smallest unit, decimal.
    pub amount: String,
    pub unlock_time: i64,
}

/// Structured selection over bundles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleQuery {
    pub lock_payment_status: Option<LockPaymentStatus>,
    pub send_deal_status: Option<SendDealStatus>,
    pub has_task: Option<bool>,
    pub include_deleted: bool,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl BundleQuery {
    /// Locked, not yet submitted, with a marketplace task.
    pub fn ready_for_submission(limit: usize) -> Self {
        Self {
            lock_payment_status: Some(LockPaymentStatus::Success),
            send_deal_status: Some(SendDealStatus::Empty),
            has_task: Some(true),
            newest_first: true,
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Locked bundles the marketplace has no task for yet.
    pub fn awaiting_task(limit: usize) -> Self {
        Self {
            lock_payment_status: Some(LockPaymentStatus::Success),
            send_deal_status: Some(SendDealStatus::Empty),
            has_task: Some(false),
            newest_first: true,
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Submitted bundles whose escrow is still open.
    pub fn submitted() -> Self {
        Self {
            lock_payment_status: Some(LockPaymentStatus::Success),
            send_deal_status: Some(SendDealStatus::Success),
            has_task: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, bundle: &DealBundle) -> bool {
        if bundle.is_deleted && !self.include_deleted {
            return false;
        }
        if let Some(status) = self.lock_payment_status {
            if bundle.lock_payment_status != status {
                return false;
            }
        }
        if let Some(status) = self.send_deal_status {
            if bundle.send_deal_status != status {
                return false;
            }
        }
        if let Some(has_task) = self.has_task {
            if bundle.has_task() != has_task {
                return false;
            }
        }
        true
    }

    /// Filter, order and bound a set of bundles.
    pub fn apply<I>(&self, bundles: I) -> Vec<DealBundle>
    where
        I: IntoIterator<Item = DealBundle>,
    {
        let mut selected: Vec<DealBundle> = bundles.into_iter().filter(|b| self.matches(b)).collect();
        if self.newest_first {
            selected.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        } else {
            selected.sort_by_key(|b| b.id);
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Structured selection over offline deals. Results keep id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DealQuery {
    pub bundle_id: Option<u64>,
    pub unlock_status: Option<UnlockStatus>,
}

impl DealQuery {
    pub fn to_unlock() -> Self {
        Self {
            bundle_id: None,
            unlock_status: Some(UnlockStatus::NotUnlocked),
        }
    }

    pub fn not_unlocked_in_bundle(bundle_id: u64) -> Self {
        Self {
            bundle_id: Some(bundle_id),
            unlock_status: Some(UnlockStatus::NotUnlocked),
        }
    }

    pub fn in_bundle(bundle_id: u64) -> Self {
        Self {
            bundle_id: Some(bundle_id),
            unlock_status: None,
        }
    }

    pub fn matches(&self, deal: &OfflineDeal) -> bool {
        self.bundle_id.map_or(true, |id| deal.bundle_id == id)
            && self.unlock_status.map_or(true, |s| deal.unlock_status == s)
    }
}
