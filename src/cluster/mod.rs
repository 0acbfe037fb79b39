pub mod collector;
pub mod coordinator;
pub mod protocol;

pub use collector::CollectorNode;
pub use coordinator::Coordinator;
