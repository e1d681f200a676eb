//! Descriptor parsing, snapshot naming, vendor/suite model, and configuration for kiln.
//!
//! This crate defines the schema layer: `WorkerDescriptor` parsing from the
//! `<kind> <locator>` strings given on the command line, `SnapshotKey` naming
//! rules for base images, the `Vendor`/`Suite` model that decides archives,
//! components and suite hierarchies, and the optional TOML configuration file
//! (`KilnConfig`). Everything here is pure apart from config file loading.

pub mod config;
pub mod descriptor;
pub mod key;
pub mod vendor;

pub use config::{
    default_config_path, default_storage_root, host_architecture, load_config, parse_config_file,
    parse_config_str, KilnConfig, TimeoutsSection, VendorSection,
};
pub use descriptor::{WorkerDescriptor, WorkerKind};
pub use key::{validate_component, SnapshotKey};
pub use vendor::{Suite, Vendor};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid worker descriptor '{input}': {reason}")]
    InvalidDescriptor { input: String, reason: String },
    #[error("invalid {field} '{value}': {reason}")]
    InvalidName {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("config file not found: {0}")]
    ConfigNotFound(String),
}
