//! Enginegate - A sidecar supervisor and router for an external engine proxy
//!
//! This library runs an engine binary next to a host HTTP application:
//! - Synthesizes the engine configuration (loopback frontend, origins, logging)
//! - Launches the engine with its configuration on stdin
//! - Detects readiness from the engine's structured log stream
//! - Restarts the engine when it crashes, unless it rejected its configuration
//! - Routes GET/POST traffic for the mount path to the engine, with loop prevention
//! - Plugs into hyper servers and tower stacks

pub mod client;
pub mod config;
pub mod error;
pub mod layer;
pub mod platform;
pub mod records;
pub mod router;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod synthesis;

pub use router::EngineRouter;
pub use supervisor::{EngineSupervisor, SupervisorEvent, SupervisorState};

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
