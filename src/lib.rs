//! stackyard - Compose stacks on Docker Swarm and multi-architecture manifest lists
//!
//! The crate covers three surfaces:
//!
//! - Stack deployment: Compose documents are loaded, converted into Swarm
//!   specs and converged against an engine (`stack`)
//! - Manifest lists, assembled in a local store and pushed to a registry (`manifest`)
//! - A namespace proxy that confines engine API clients to one project (`proxy`)

pub mod compose;
pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod format;
pub mod manifest;
pub mod proxy;
pub mod reference;
pub mod registry;
pub mod stack;
pub mod swarm;

pub use error::{Result, StackError};
