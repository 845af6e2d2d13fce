//! State built once at startup and shared with every component.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use mediad_core::{Config, ResourceDescriptor};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything the daemon resolved before it started serving.
///
/// Read-only after construction; shared through `Arc`.
#[derive(Debug)]
pub struct DaemonContext {
    pub config: Config,
    /// `None` when the descriptor was missing, unparsable or codecs are disabled.
    pub descriptor: Option<ResourceDescriptor>,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl DaemonContext {
    pub fn new(config: Config, descriptor: Option<ResourceDescriptor>) -> Self {
        Self {
            config,
            descriptor,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
