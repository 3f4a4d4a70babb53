//! Uniform entry point for the node service.
//!
//! A [`Connectivity`] owns a transport [`Rescanner`], which owns the shared
//! [`ScsiGenericHelper`], which owns the [`Executor`]. Callers only ever hold
//! a `Connectivity`.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::error::Result;
use crate::executor::Executor;
use crate::scsi_generic::{ScsiGenericHelper, Timeouts};
use crate::transport::Rescanner;
use crate::types::{ConnectivityType, FcSubsystem, MultipathDevice, SlaveDevice, VolumeIdentity};

/// Process-wide settings shared by every [`Connectivity`].
#[derive(Clone)]
pub struct ConnectivityOptions {
    pub timeouts: Timeouts,
    pub fc_subsystem: FcSubsystem,
    pub require_multiple_paths: bool,
    /// Serializes `multipath -f` across all transports.
    pub flush_lock: Arc<Mutex<()>>,
}

impl Default for ConnectivityOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            fc_subsystem: FcSubsystem::default(),
            require_multiple_paths: false,
            flush_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub struct Connectivity {
    rescanner: Rescanner,
}

impl Connectivity {
    pub fn new(
        connectivity_type: ConnectivityType,
        executor: Arc<dyn Executor>,
        options: &ConnectivityOptions,
    ) -> Self {
        let helper = ScsiGenericHelper::new(executor)
            .with_flush_lock(Arc::clone(&options.flush_lock))
            .with_timeouts(options.timeouts)
            .with_require_multiple_paths(options.require_multiple_paths);
        Self {
            rescanner: Rescanner::new(connectivity_type, Arc::new(helper), options.fc_subsystem),
        }
    }

    /// Build from a request token such as `"iscsi"` or `"FC"`.
    pub fn from_token(
        token: &str,
        executor: Arc<dyn Executor>,
        options: &ConnectivityOptions,
    ) -> Result<Self> {
        Ok(Self::new(token.parse()?, executor, options))
    }

    pub fn connectivity_type(&self) -> ConnectivityType {
        self.rescanner.connectivity_type()
    }

    fn helper(&self) -> &ScsiGenericHelper {
        self.rescanner.helper()
    }

    #[instrument(skip(self), fields(transport = %self.connectivity_type()))]
    pub async fn rescan_devices(&self, lun: u32, array_ids: &[String]) -> Result<()> {
        self.rescanner.rescan(lun, array_ids).await
    }

    /// Device path (`/dev/dm-N`) of the multipath device for `volume`.
    pub async fn get_mpath_device(&self, volume: &VolumeIdentity) -> Result<String> {
        self.helper().get_mpath_device(volume).await
    }

    pub async fn flush_multipath_device(&self, dm_name: &str) -> Result<()> {
        self.helper().flush_multipath_device(dm_name).await
    }

    pub async fn remove_physical_device(&self, slaves: &[SlaveDevice]) -> Result<()> {
        self.helper().remove_physical_device(slaves).await
    }

    #[instrument(skip(self), fields(transport = %self.connectivity_type()))]
    pub async fn ensure_login(&self, array_ids: &[String]) -> Result<()> {
        self.rescanner.ensure_login(array_ids).await?;
        info!("Host is connected to storage");
        Ok(())
    }

    pub async fn find_mpath_device(
        &self,
        volume: &VolumeIdentity,
    ) -> Result<Option<MultipathDevice>> {
        self.helper().find_mpath_device(volume).await
    }

    pub async fn get_slave_devices(&self, dm_name: &str) -> Result<Vec<SlaveDevice>> {
        self.helper().get_slave_devices(dm_name).await
    }
}
