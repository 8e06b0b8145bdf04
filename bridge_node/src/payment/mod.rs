//! Lock Payment Operation - user-triggered escrow deposits

pub mod lock;
pub mod promotion;

pub use lock::{LockPaymentOutcome, LockPaymentRequest, LockPaymentService};
pub use promotion::promote_if_paid;
