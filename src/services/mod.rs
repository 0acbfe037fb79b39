pub mod aggregator;
pub mod connections;
pub mod persistence;
pub mod query;
pub mod resampler;

pub use aggregator::BarAggregator;
pub use connections::{ConnectionRegistry, LoggingCrossoverHook, PriceCrossoverHook};
pub use persistence::{AlertChange, Persistence};
pub use query::{FetchParams, FetchResponse, PendingSource, QueryService};
pub use resampler::Resampler;
