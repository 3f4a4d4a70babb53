//! NVMe over Fibre Channel.
//!
//! The NVMe controller exposes namespaces on its own, so there is nothing to
//! rescan and no login to verify; device resolution goes through the shared
//! multipath helper like the SCSI transports.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::scsi_generic::ScsiGenericHelper;

pub struct NvmeOfcRescanner {
    helper: Arc<ScsiGenericHelper>,
}

impl NvmeOfcRescanner {
    pub fn new(helper: Arc<ScsiGenericHelper>) -> Self {
        Self { helper }
    }

    pub fn helper(&self) -> &Arc<ScsiGenericHelper> {
        &self.helper
    }

    pub async fn rescan(&self, lun: u32, _array_ids: &[String]) -> Result<()> {
        debug!(namespace = lun, "NVMe-oFC namespaces appear without rescan");
        Ok(())
    }

    pub async fn ensure_login(&self, _array_ids: &[String]) -> Result<()> {
        Ok(())
    }
}
