pub mod aggregation;
pub mod api;
pub mod archival;
pub mod clock;
pub mod commands;
pub mod config;
pub mod ingestion;
pub mod ledger;
pub mod metrics_server;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod scheduler;
pub mod settlement;
pub mod sources;
pub mod telemetry;

pub use pipeline::{BrokerMessage, Envelope, Pipeline};
