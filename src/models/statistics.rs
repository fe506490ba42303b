use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::trade::{Trade, TradeStatus};

/// Realized results for one token across all of its sold trades.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenProfit {
    pub token_address: Address,
    pub total_buy_cost: U256,
    pub total_sold_proceeds: U256,
    pub profit: U256,
    pub trades: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HoldingRecord {
    pub trade_id: String,
    pub wallet: Address,
    pub token_address: Address,
    pub buy_cost: U256,
    pub buy_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct TradeStatistics {
    pub sold: Vec<TokenProfit>,
    pub total_profit: U256,
    pub holdings: Vec<HoldingRecord>,
    pub total_open_investment: U256,
    pub failed_trades: u32,
}

impl TradeStatistics {
    pub fn from_trades(trades: &[Trade]) -> Self {
        let mut by_token: BTreeMap<Address, TokenProfit> = BTreeMap::new();
        let mut stats = Self::default();

        for trade in trades {
            match trade.status {
                TradeStatus::Sold => {
                    let entry = by_token.entry(trade.token_address).or_insert_with(|| TokenProfit {
                        token_address: trade.token_address,
                        total_buy_cost: U256::zero(),
                        total_sold_proceeds: U256::zero(),
                        profit: U256::zero(),
                        trades: 0,
                    });
                    let profit = trade.profit.unwrap_or_default();
                    entry.total_buy_cost = entry.total_buy_cost.saturating_add(trade.buy_cost);
                    entry.total_sold_proceeds = entry
                        .total_sold_proceeds
                        .saturating_add(trade.sold_proceeds.unwrap_or_default());
                    entry.profit = entry.profit.saturating_add(profit);
                    entry.trades += 1;
                    stats.total_profit = stats.total_profit.saturating_add(profit);
                }
                TradeStatus::Bought => {
                    stats.total_open_investment = stats.total_open_investment.saturating_add(trade.buy_cost);
                    stats.holdings.push(HoldingRecord {
                        trade_id: trade.id.clone(),
                        wallet: trade.wallet,
                        token_address: trade.token_address,
                        buy_cost: trade.buy_cost,
                        buy_time: trade.buy_time,
                    });
                }
                TradeStatus::Failed => stats.failed_trades += 1,
            }
        }

        stats.holdings.sort_by_key(|h| h.buy_time);
        stats.sold = by_token.into_values().collect();
        stats
    }
}
