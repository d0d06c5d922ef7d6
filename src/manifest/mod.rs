//! Manifest lists
//!
//! Lists are assembled in a local store, annotated, then pushed to a
//! registry in one go.

pub mod commands;
pub mod platform;
pub mod push;
pub mod store;
pub mod types;

pub use commands::{AnnotateOptions, CreateOptions, PushOptions};
pub use push::{build_push_request, MountPolicy, PushRequest};
pub use store::ManifestStore;
pub use types::{Descriptor, ImageManifest, ManifestList, Platform};
