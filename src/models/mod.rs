pub mod launch;
pub mod statistics;
pub mod trade;

// Re-export commonly used types
pub use launch::LaunchEvent;
pub use statistics::TradeStatistics;
pub use trade::{realized_profit, Trade, TradeStatus, TradeUpdate};
