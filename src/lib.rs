pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod flood_control;
pub mod redis_connection_manager;
pub mod retry;
pub mod retry_strategy;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use entry::Entry;
pub use error::{ConfigError, FloodControlError, Result};
pub use flood_control::{FloodControl, SlidingWindowFloodControl, SweepReport};
pub use store::{CounterDrift, MemoryStore, PopOutcome, RedisStore, WindowStore};
pub use sweeper::spawn_sweeper;
