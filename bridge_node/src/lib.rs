//! Payment bridge between a storage marketplace and an on-chain escrow.
//!
//! Uploaded files are bundled into archives, submitted to the marketplace
//! once their fees are escrowed, and the escrow is released to the storage
//! provider (or refunded to the depositor) as deals complete.

pub mod archiver;
pub mod billing;
pub mod chain;
pub mod common;
pub mod config;
pub mod jobs;
pub mod marketplace;
pub mod payment;
pub mod storage;
pub mod upload;

pub use common::{BridgeError, Result};
pub use config::Config;
