mod error;
mod time;

pub use error::{BridgeError, Result};
pub use time::{current_epoch, now_millis, EPOCHS_PER_HOUR};
