pub mod buyer;
pub mod dedup;
pub mod engine;
pub mod launch_detector;
pub mod position_monitor;
pub mod reconnect;
pub mod seller;

pub use engine::Engine;
