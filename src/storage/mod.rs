pub mod ledger;

pub use ledger::{SledLedger, TradeLedger};
