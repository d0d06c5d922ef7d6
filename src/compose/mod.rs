//! Compose document model and loader
//!
//! Documents go through parse, interpolation, validation, `extends`/`include`
//! resolution and semantic merging before reaching the converter.

pub mod config;
pub mod interpolate;
pub mod loader;
pub mod merge;
pub mod syntax;
pub mod validate;

pub use config::{ComposeConfig, ServiceConfig};
pub use loader::{get_config_details, load, ConfigDetails, ConfigFile, LoadOptions, LoadedCompose};
pub use merge::Merge;
pub use validate::PropertyReport;
