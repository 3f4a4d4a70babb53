//! iSCSI host discovery and LUN rescan.
//!
//! Sessions are found through the kernel's iSCSI transport class:
//! `/sys/class/iscsi_host/hostN/device/sessionM/iscsi_session/sessionM/targetname`
//! holds the target IQN each session is logged into.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::host_number_after;
use crate::error::{ConnectivityError, Result};
use crate::scsi_generic::ScsiGenericHelper;
use crate::types::{ConnectivityType, Iqn, parse_all};

pub const TARGETNAME_GLOB: &str =
    "/sys/class/iscsi_host/host*/device/session*/iscsi_session/session*/targetname";

pub struct IscsiRescanner {
    helper: Arc<ScsiGenericHelper>,
}

impl IscsiRescanner {
    pub fn new(helper: Arc<ScsiGenericHelper>) -> Self {
        Self { helper }
    }

    pub fn helper(&self) -> &Arc<ScsiGenericHelper> {
        &self.helper
    }

    /// Host numbers with a session to any of `array_ids`, sorted.
    #[instrument(skip(self))]
    pub async fn session_hosts(&self, array_ids: &[String]) -> Result<Vec<u32>> {
        let iqns = parse_all(array_ids, Iqn::parse)?;

        let mut hosts = Vec::new();
        for path in self.helper.glob(TARGETNAME_GLOB).await? {
            let Some(host) = host_number_after(&path, "iscsi_host") else {
                debug!(path = %path.display(), "Skipping session with unparsable host");
                continue;
            };
            let content = match self.helper.read_file(&path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e @ ConnectivityError::FilesystemTimeout { .. }) => return Err(e),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read targetname");
                    continue;
                }
            };
            if iqns.iter().any(|iqn| iqn.matches_targetname(&content)) {
                debug!(host, target = %content.trim(), "Found iSCSI session");
                hosts.push(host);
            }
        }
        hosts.sort_unstable();
        hosts.dedup();

        if hosts.is_empty() {
            return Err(ConnectivityError::StorageTargetNotFound {
                array_ids: array_ids.to_vec(),
            });
        }
        Ok(hosts)
    }

    pub async fn rescan(&self, lun: u32, array_ids: &[String]) -> Result<()> {
        let hosts = self.session_hosts(array_ids).await?;
        self.helper
            .rescan_devices(ConnectivityType::Iscsi, lun, array_ids, &hosts)
            .await
    }

    /// Succeeds when at least one session to the array exists.
    pub async fn ensure_login(&self, array_ids: &[String]) -> Result<()> {
        let hosts = self.session_hosts(array_ids).await?;
        info!(hosts = ?hosts, "iSCSI sessions present");
        Ok(())
    }
}
