pub mod api;
pub mod broker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod queue;
pub mod telemetry;

pub use error::{QueueError, Stage};
