//! Node configuration file.
//!
//! An optional JSON document; every field has a default so an empty object
//! (or no file at all) is a valid configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use device_connectivity::{
    ConnectivityOptions, Executor, FcSubsystem, LimitedExecutor, SystemExecutor, Timeouts,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{NodeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `multipathd show maps` and `multipathd reconfigure`
    pub multipathd_timeout_ms: u64,
    /// `multipath -f`
    pub multipath_flush_timeout_ms: u64,
    pub sg_inq_timeout_ms: u64,
    /// Each sysfs glob, read or control-file write
    pub sysfs_timeout_ms: u64,
    /// Cap on concurrently running subprocesses; 0 means unbounded.
    pub max_concurrent_commands: usize,
    pub fc_subsystem: FcSubsystem,
    /// Refuse multipath devices backed by a single path.
    pub require_multiple_paths: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            multipathd_timeout_ms: timeouts.multipathd.as_millis() as u64,
            multipath_flush_timeout_ms: timeouts.flush.as_millis() as u64,
            sg_inq_timeout_ms: timeouts.sg_inq.as_millis() as u64,
            sysfs_timeout_ms: timeouts.sysfs.as_millis() as u64,
            max_concurrent_commands: 0,
            fc_subsystem: FcSubsystem::default(),
            require_multiple_paths: false,
        }
    }
}

impl NodeConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&contents)?;
        info!(path = %path.display(), "Loaded node configuration");
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("multipathd_timeout_ms", self.multipathd_timeout_ms),
            ("multipath_flush_timeout_ms", self.multipath_flush_timeout_ms),
            ("sg_inq_timeout_ms", self.sg_inq_timeout_ms),
            ("sysfs_timeout_ms", self.sysfs_timeout_ms),
        ] {
            if value == 0 {
                return Err(NodeError::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            multipathd: Duration::from_millis(self.multipathd_timeout_ms),
            flush: Duration::from_millis(self.multipath_flush_timeout_ms),
            sg_inq: Duration::from_millis(self.sg_inq_timeout_ms),
            sysfs: Duration::from_millis(self.sysfs_timeout_ms),
        }
    }

    pub fn connectivity_options(&self) -> ConnectivityOptions {
        ConnectivityOptions {
            timeouts: self.timeouts(),
            fc_subsystem: self.fc_subsystem,
            require_multiple_paths: self.require_multiple_paths,
            ..ConnectivityOptions::default()
        }
    }

    /// The host executor, wrapped in a semaphore when a cap is configured.
    pub fn executor(&self) -> Arc<dyn Executor> {
        let system: Arc<dyn Executor> = Arc::new(SystemExecutor::new());
        if self.max_concurrent_commands > 0 {
            Arc::new(LimitedExecutor::new(system, self.max_concurrent_commands))
        } else {
            system
        }
    }
}
