use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, error, info};

use crate::error::SniperError;
use crate::models::{Trade, TradeUpdate};

/// Durable record of every trade, keyed by trade id.
#[async_trait]
pub trait TradeLedger: Send + Sync + 'static {
    /// Inserts a new trade. Existing ids are never overwritten.
    async fn put(&self, trade: &Trade) -> Result<(), SniperError>;

    async fn get(&self, id: &str) -> Result<Option<Trade>, SniperError>;

    /// Atomically applies `update` to an existing trade and returns the stored result.
    async fn update(&self, id: &str, update: TradeUpdate) -> Result<Trade, SniperError>;

    async fn scan(&self, predicate: &(dyn for<'t> Fn(&'t Trade) -> bool + Send + Sync)) -> Result<Vec<Trade>, SniperError>;

    /// Monotonically increasing local id for trades whose hash is not known.
    async fn next_local_id(&self) -> Result<String, SniperError>;

    async fn flush(&self) -> Result<(), SniperError>;

    async fn open_trades(&self) -> Result<Vec<Trade>, SniperError> {
        self.scan(&|trade: &Trade| trade.is_open()).await
    }

    async fn all_trades(&self) -> Result<Vec<Trade>, SniperError> {
        self.scan(&|_: &Trade| true).await
    }
}

/// [`TradeLedger`] backed by an embedded sled tree of JSON records.
pub struct SledLedger {
    db: sled::Db,
    trades: sled::Tree,
}

impl SledLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SniperError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            error!("Failed to open trade ledger at {:?}: {}", path, e);
            SniperError::from(e)
        })?;
        let ledger = Self::from_db(db)?;
        info!("Trade ledger opened at {:?} ({} records)", path, ledger.trades.len());
        Ok(ledger)
    }

    /// Ledger that disappears when dropped.
    #[cfg(test)]
    pub fn temporary() -> Result<Self, SniperError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, SniperError> {
        let trades = db.open_tree("trades")?;
        Ok(Self { db, trades })
    }

    fn decode(bytes: &[u8]) -> Result<Trade, SniperError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl TradeLedger for SledLedger {
    async fn put(&self, trade: &Trade) -> Result<(), SniperError> {
        let encoded = serde_json::to_vec(trade)?;
        let inserted = self
            .trades
            .compare_and_swap(trade.id.as_bytes(), None as Option<&[u8]>, Some(encoded))?;
        if inserted.is_err() {
            return Err(SniperError::LedgerInconsistency(format!(
                "trade {} already exists",
                trade.id
            )));
        }
        self.trades.flush_async().await?;
        debug!("Stored trade {} ({})", trade.id, trade.status);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Trade>, SniperError> {
        match self.trades.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, update: TradeUpdate) -> Result<Trade, SniperError> {
        loop {
            let current = self.trades.get(id.as_bytes())?.ok_or_else(|| {
                SniperError::LedgerInconsistency(format!("update of unknown trade {}", id))
            })?;

            let mut trade = Self::decode(&current)?;
            trade.apply(update.clone())?;
            let encoded = serde_json::to_vec(&trade)?;

            // Retry if the record changed between read and write.
            match self
                .trades
                .compare_and_swap(id.as_bytes(), Some(current), Some(encoded))?
            {
                Ok(()) => {
                    self.trades.flush_async().await?;
                    debug!("Trade {} moved to {}", id, trade.status);
                    return Ok(trade);
                }
                Err(_) => continue,
            }
        }
    }

    async fn scan(&self, predicate: &(dyn for<'t> Fn(&'t Trade) -> bool + Send + Sync)) -> Result<Vec<Trade>, SniperError> {
        let mut matched = Vec::new();
        for entry in self.trades.iter() {
            let (_, bytes) = entry?;
            let trade = Self::decode(&bytes)?;
            if predicate(&trade) {
                matched.push(trade);
            }
        }
        Ok(matched)
    }

    async fn next_local_id(&self) -> Result<String, SniperError> {
        Ok(format!("local-{:020}", self.db.generate_id()?))
    }

    async fn flush(&self) -> Result<(), SniperError> {
        self.db.flush_async().await?;
        Ok(())
    }
}
