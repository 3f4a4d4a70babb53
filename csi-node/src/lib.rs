//! Node-side consumer of the device connectivity engine
//!
//! This library provides:
//! - Request parsing and validation from orchestrator volume contexts
//! - The stage/unstage control flow on top of the connectivity façade
//! - Node configuration, metrics and error to gRPC status mapping

pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod types;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::NodeService;
pub use types::{ArrayIdentifiers, StageRequest, StageResponse, UnstageRequest, UnstageResponse};
