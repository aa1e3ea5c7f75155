pub use crate::builder::CacheMapBuilder;
pub use crate::error::{ConfigError, InvariantError};
pub use crate::map::{CacheMap, Strength};
pub use crate::notification::{RemovalCause, RemovalListener, RemovalNotification};
pub use crate::time::{FakeTicker, SystemTicker, Ticker};
