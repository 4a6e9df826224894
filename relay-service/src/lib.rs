pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics_server;
pub mod monitor;
pub mod observability;
pub mod ota;
pub mod overview;
pub mod pipeline;
pub mod pubsub;
pub mod registry;
pub mod relay;
pub mod reset;
pub mod sinks;
pub mod sources;
pub mod store;
pub mod transform;

pub use pipeline::{Envelope, Pipeline};
