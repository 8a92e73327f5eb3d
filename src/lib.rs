pub mod checks;
pub mod config;
pub mod engine;
pub mod envprobe;
pub mod errors;
pub mod lease;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod state;
pub mod util;
pub mod vcs;
pub mod workspace;

// Shared record types, re-exported so callers need one dependency.
pub use shipyard_common as common;
