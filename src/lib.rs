//! # class-share
//!
//! Class loading with a pluggable shared-class provider, plus a
//! deserialization class cache keyed by initiating loader.
//!
//! ## Architecture
//!
//! - **loader**: Parent-delegating class loaders and the bootstrap/platform/application hierarchy
//! - **bridge**: Per-loader attachment to a shared-class provider, turning every call into an outcome
//! - **metadata**: Index-addressed code source + manifest records used by cached definitions
//! - **provider**: Provider traits, the classpath provider and its memory/LMDB stores
//! - **resource**: Directory and jar search paths (memory-mapped zip access)
//! - **module**: Module locations, patch roots and `jrt:` location mapping
//! - **manifest**: Jar manifest parsing
//! - **package**: Package definitions and sealing checks
//! - **deser**: Resolution cache for deserialization with background reaping of dropped loaders
//! - **config**: Environment toggles and database path resolution

pub mod bridge;
pub mod class;
pub mod cli;
pub mod config;
pub mod deser;
pub mod error;
pub mod loader;
pub mod manifest;
pub mod metadata;
pub mod module;
pub mod package;
pub mod provider;
pub mod resource;
