//! mediad core library: configuration store and resource descriptor loading.
//!
//! - [`config`]: load / persist the daemon configuration with defaults
//! - [`descriptor`]: soft-fail loading of the resource descriptor
//! - [`error`]: [`ConfigError`], [`ValueError`], [`DescriptorError`]

pub mod config;
pub mod descriptor;
pub mod error;

pub use config::{Config, ConfigValue, ServerSettings};
pub use descriptor::{DescriptorParser, ResourceDescriptor, SessionDescriptionParser};
pub use error::{ConfigError, DescriptorError, ValueError};
