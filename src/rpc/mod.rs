//! Two-party RPC plumbing: schema, framing and client

pub mod client;
pub mod codec;
pub mod schema;

pub use client::FeatureClient;
pub use schema::{Bootstrap, Call, CallError, CallResult, Method, Return};
