pub mod flush;

pub use flush::{now_ms, FlushPipeline, TradeQueue};
