//! reactive-deploy: deployment orchestrator for reactive TEE applications
//!
//! Builds, loads, attests and connects Sancus, SGX and TrustZone modules
//! on networked nodes, driven by a JSON deployment description.

pub mod config;
pub mod connection;
pub mod context;
pub mod deploy;
pub mod error;
pub mod memo;
pub mod module;
pub mod network;
pub mod node;
pub mod periodic_event;
pub mod toolchain;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use connection::{Connection, ConnectionIds, ConnectionIo, Encryption};
pub use context::Context;
pub use deploy::{DeployOrder, Deployer};
pub use error::{Error, ErrorCategory, Result};
pub use module::{EndpointRef, Module, ModuleKind};
pub use node::{Node, NodeKind};
pub use periodic_event::PeriodicEvent;
pub use toolchain::Settings;
