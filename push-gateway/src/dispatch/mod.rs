pub mod correlation;
pub mod feedback;
pub mod gateway;
pub mod redelivery;

pub use correlation::CorrelationTable;
pub use feedback::spawn_feedback_consumer;
pub use gateway::{spawn_completion_loop, PushGateway};
pub use redelivery::RedeliveryLoop;
