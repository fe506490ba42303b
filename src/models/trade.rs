use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::SniperError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Bought,
    Sold,
    Failed,
}

impl TradeStatus {
    /// Only `Bought` may move, and only forward.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        matches!(
            (self, next),
            (TradeStatus::Bought, TradeStatus::Sold) | (TradeStatus::Bought, TradeStatus::Failed)
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bought => write!(f, "BOUGHT"),
            Self::Sold => write!(f, "SOLD"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A single bought position and, once closed, its exit.
///
/// Records are append-only: `buy_cost` and `purchased_quantity` never change after
/// creation and the exit fields are written exactly once through [`Trade::apply`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trade {
    pub id: String,
    /// Wallet that holds the position and must sign its exit.
    #[serde(default)]
    pub wallet: Address,
    pub token_address: Address,
    pub pair_address: Address,

    // Entry
    pub buy_cost: U256,
    pub purchased_quantity: U256,
    pub buy_time: DateTime<Utc>,

    // Exit
    pub sell_id: Option<String>,
    pub sell_time: Option<DateTime<Utc>>,
    pub sold_proceeds: Option<U256>,
    pub profit: Option<U256>,
    pub failure_reason: Option<String>,

    pub status: TradeStatus,
}

/// The only mutations a ledger accepts for an existing trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeUpdate {
    Sold {
        sell_id: String,
        sell_time: DateTime<Utc>,
        sold_proceeds: U256,
        profit: U256,
    },
    Failed {
        reason: String,
    },
}

impl TradeUpdate {
    pub fn target_status(&self) -> TradeStatus {
        match self {
            Self::Sold { .. } => TradeStatus::Sold,
            Self::Failed { .. } => TradeStatus::Failed,
        }
    }
}

impl Trade {
    pub fn bought(
        id: String,
        wallet: Address,
        token_address: Address,
        pair_address: Address,
        buy_cost: U256,
        purchased_quantity: U256,
    ) -> Self {
        Self {
            id,
            wallet,
            token_address,
            pair_address,
            buy_cost,
            purchased_quantity,
            buy_time: Utc::now(),
            sell_id: None,
            sell_time: None,
            sold_proceeds: None,
            profit: None,
            failure_reason: None,
            status: TradeStatus::Bought,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Bought
    }

    /// Applies an update in place, enforcing the status machine and the
    /// `profit = sold_proceeds - buy_cost` invariant.
    pub fn apply(&mut self, update: TradeUpdate) -> Result<(), SniperError> {
        let next = update.target_status();
        if !self.status.can_transition_to(next) {
            return Err(SniperError::LedgerInconsistency(format!(
                "trade {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        match update {
            TradeUpdate::Sold {
                sell_id,
                sell_time,
                sold_proceeds,
                profit,
            } => {
                let expected = realized_profit(self.buy_cost, sold_proceeds)?;
                if expected != profit {
                    return Err(SniperError::LedgerInconsistency(format!(
                        "trade {} profit {} does not match proceeds {} - cost {}",
                        self.id, profit, sold_proceeds, self.buy_cost
                    )));
                }
                self.sell_id = Some(sell_id);
                self.sell_time = Some(sell_time);
                self.sold_proceeds = Some(sold_proceeds);
                self.profit = Some(profit);
            }
            TradeUpdate::Failed { reason } => {
                self.failure_reason = Some(reason);
            }
        }
        self.status = next;
        Ok(())
    }
}

/// Exact integer profit of an exit. Exits below cost are not representable.
pub fn realized_profit(buy_cost: U256, proceeds: U256) -> Result<U256, SniperError> {
    proceeds.checked_sub(buy_cost).ok_or_else(|| {
        SniperError::LedgerInconsistency(format!(
            "exit proceeds {} are below buy cost {}",
            proceeds, buy_cost
        ))
    })
}
