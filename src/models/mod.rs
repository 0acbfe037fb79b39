mod bar;
mod time_range;
mod trade;
pub mod timeframe;

pub use bar::Bar;
pub use time_range::TimeRange;
pub use trade::{Side, Trade};

use std::collections::HashMap;

/// Bars not yet written to the store, per market, strictly increasing
/// unique `time` within each list.
pub type PendingBars = HashMap<String, Vec<Bar>>;
