//! Feature Server Library
//!
//! Loads one pre-trained model and answers `computeFeature(features) -> score`
//! calls over a persistent two-party connection.

pub mod cli;
pub mod config;
pub mod error;
pub mod feature;
pub mod metrics;
pub mod models;
pub mod rpc;
pub mod server;

pub use config::ServerConfig;
pub use error::{ServeError, ServeResult};
pub use feature::FeatureCapability;
pub use models::{BackendKind, ModelBackend};
pub use rpc::FeatureClient;
pub use server::{BindAddress, BoundServer, ConnectionServer};
