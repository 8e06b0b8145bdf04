//! Billing reads for the upload/billing API.

use crate::common::{BridgeError, Result};
use crate::config::BillingConfig;
use crate::storage::{
    DealBundle, DealQuery, LockPaymentEvent, LockPaymentStatus, OfflineDeal, SourceFile, StateStore,
    UnlockPaymentEvent,
};
use log::debug;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One escrow deposit with what became of it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingRecord {
    pub lock: LockPaymentEvent,
    pub file_name: Option<String>,
    pub bundle_id: Option<u64>,
    pub lock_payment_status: Option<LockPaymentStatus>,
    /// Releases for the deals of the paid bundle.
    pub unlocks: Vec<UnlockPaymentEvent>,
}

/// A bundle with its files and marketplace deals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleStatus {
    pub bundle: DealBundle,
    pub files: Vec<SourceFile>,
    pub deals: Vec<OfflineDeal>,
}

pub struct BillingService {
    store: Arc<dyn StateStore>,
}

impl BillingService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Deposits made by `wallet`, newest first, optionally narrowed to one
    /// transaction hash.
    pub async fn history(
        &self,
        wallet: &str,
        tx_hash: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BillingRecord>> {
        let mut locks = self.store.lock_payment_events_by_wallet(wallet).await?;
        if let Some(hash) = tx_hash.map(str::trim).filter(|h| !h.is_empty()) {
            locks.retain(|e| e.tx_hash.eq_ignore_ascii_case(hash));
        }
        locks.sort_by(|a, b| b.lock_time.cmp(&a.lock_time).then(b.id.cmp(&a.id)));

        let mut records = Vec::new();
        for lock in locks.into_iter().skip(offset).take(limit) {
            records.push(self.enrich(lock).await?);
        }
        Ok(records)
    }

    async fn enrich(&self, lock: LockPaymentEvent) -> Result<BillingRecord> {
        let mut record = BillingRecord {
            lock,
            file_name: None,
            bundle_id: None,
            lock_payment_status: None,
            unlocks: Vec::new(),
        };
        let Some(file_id) = record.lock.source_file_id else {
            return Ok(record);
        };

        record.file_name = self.store.get_source_file(file_id).await?.map(|f| f.file_name);
        let Some(bundle_id) = self.store.bundle_id_for_source_file(file_id).await? else {
            return Ok(record);
        };
        record.bundle_id = Some(bundle_id);
        record.lock_payment_status = self.store.get_bundle(bundle_id).await?.map(|b| b.lock_payment_status);

        for deal in self.store.find_offline_deals(&DealQuery::in_bundle(bundle_id)).await? {
            record
                .unlocks
                .extend(self.store.unlock_payment_events_by_deal(deal.deal_id).await?);
        }
        Ok(record)
    }

    pub async fn bundle_status(&self, bundle_id: u64) -> Result<Option<BundleStatus>> {
        let Some(bundle) = self.store.get_bundle(bundle_id).await? else {
            return Ok(None);
        };
        let files = self.store.source_files_by_bundle(bundle_id).await?;
        let deals = self.store.find_offline_deals(&DealQuery::in_bundle(bundle_id)).await?;
        Ok(Some(BundleStatus { bundle, files, deals }))
    }
}

/// Latest quote of the escrow coin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoinPrice {
    pub coin: String,
    pub currency: String,
    pub price: f64,
}

/// Reads coin prices from a CoinGecko-style `simple/price` endpoint
pub struct PriceFeed {
    client: Client,
    url: String,
    coin: String,
    currency: String,
}

impl PriceFeed {
    pub fn new(config: &BillingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.price_timeout_secs))
            .build()
            .map_err(|e| BridgeError::Price(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.price_api_url.clone(),
            coin: config.price_coin.clone(),
            currency: config.price_currency.clone(),
        })
    }

    pub async fn latest_price(&self) -> Result<CoinPrice> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("ids", self.coin.as_str()), ("vs_currencies", self.currency.as_str())])
            .send()
            .await
            .map_err(|e| BridgeError::Price(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Price(format!("price endpoint returned {status}")));
        }
        let quotes: HashMap<String, HashMap<String, f64>> =
            response.json().await.map_err(|e| BridgeError::Price(e.to_string()))?;
        let price = pick_price(&quotes, &self.coin, &self.currency)?;
        debug!("{} price {} {}", self.coin, price, self.currency);
        Ok(CoinPrice {
            coin: self.coin.clone(),
            currency: self.currency.clone(),
            price,
        })
    }
}

fn pick_price(quotes: &HashMap<String, HashMap<String, f64>>, coin: &str, currency: &str) -> Result<f64> {
    quotes
        .get(coin)
        .and_then(|q| q.get(currency))
        .copied()
        .ok_or_else(|| BridgeError::Price(format!("no {currency} quote for {coin}")))
}
