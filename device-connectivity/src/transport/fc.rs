//! Fibre Channel host discovery and LUN rescan.
//!
//! A host is rescanned only if its port is online and it has a remote port
//! whose `port_name` is one of the array's WWPNs.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::host_number_after;
use crate::error::{ConnectivityError, Result};
use crate::scsi_generic::ScsiGenericHelper;
use crate::types::{ConnectivityType, FcSubsystem, PortState, Wwpn, parse_all};

pub const PORT_STATE_GLOB: &str = "/sys/class/fc_host/host*/port_state";

impl FcSubsystem {
    /// Glob over the `port_name` of every FC remote port.
    pub fn remote_port_glob(self) -> &'static str {
        match self {
            FcSubsystem::Scsi => "/sys/class/fc_remote_ports/rport-*/port_name",
            FcSubsystem::Ccw => {
                "/sys/bus/ccw/drivers/zfcp/*/host*/rport-*/fc_remote_ports/rport-*/port_name"
            }
        }
    }
}

/// Host number from an `rport-<host>:<bus>-<n>` directory name.
fn rport_host_number(port_name_path: &Path) -> Option<u32> {
    let rport = port_name_path.parent()?.file_name()?.to_str()?;
    let (host, _) = rport.strip_prefix("rport-")?.split_once(':')?;
    host.parse().ok()
}

pub struct FcRescanner {
    helper: Arc<ScsiGenericHelper>,
    subsystem: FcSubsystem,
}

impl FcRescanner {
    pub fn new(helper: Arc<ScsiGenericHelper>, subsystem: FcSubsystem) -> Self {
        Self { helper, subsystem }
    }

    pub fn helper(&self) -> &Arc<ScsiGenericHelper> {
        &self.helper
    }

    pub fn subsystem(&self) -> FcSubsystem {
        self.subsystem
    }

    async fn read_trimmed(&self, path: &Path) -> Result<String> {
        let bytes = self.helper.read_file(path).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// FC hosts whose port is online, sorted.
    #[instrument(skip(self))]
    pub async fn online_hosts(&self, array_ids: &[String]) -> Result<Vec<u32>> {
        let mut hosts = Vec::new();
        for path in self.helper.glob(PORT_STATE_GLOB).await? {
            let Some(host) = host_number_after(&path, "fc_host") else {
                continue;
            };
            match self.read_trimmed(&path).await {
                Ok(state) if PortState::parse(&state).is_online() => hosts.push(host),
                Ok(state) => debug!(host, state = %state, "Skipping FC host that is not online"),
                Err(e @ ConnectivityError::FilesystemTimeout { .. }) => return Err(e),
                Err(e) => warn!(host, error = %e, "Failed to read FC port state"),
            }
        }
        hosts.sort_unstable();
        hosts.dedup();

        if hosts.is_empty() {
            return Err(ConnectivityError::FcHostTargetNotFound {
                array_ids: array_ids.to_vec(),
            });
        }
        Ok(hosts)
    }

    /// Hosts backing a remote port whose WWPN is one of `wwpns`, sorted.
    #[instrument(skip(self))]
    pub async fn target_hosts(&self, wwpns: &[Wwpn]) -> Result<Vec<u32>> {
        let mut hosts = Vec::new();
        for path in self.helper.glob(self.subsystem.remote_port_glob()).await? {
            let Some(host) = rport_host_number(&path) else {
                debug!(path = %path.display(), "Skipping remote port with unparsable name");
                continue;
            };
            match self.read_trimmed(&path).await {
                Ok(port_name) if wwpns.iter().any(|w| w.matches_port_name(&port_name)) => {
                    debug!(host, port_name = %port_name, "Found FC remote port");
                    hosts.push(host);
                }
                Ok(_) => {}
                Err(e @ ConnectivityError::FilesystemTimeout { .. }) => return Err(e),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read port name"),
            }
        }
        hosts.sort_unstable();
        hosts.dedup();
        Ok(hosts)
    }

    /// Live hosts that can reach the array.
    pub async fn rescan_hosts(&self, array_ids: &[String]) -> Result<Vec<u32>> {
        let wwpns = parse_all(array_ids, Wwpn::parse)?;
        let online = self.online_hosts(array_ids).await?;
        let targets = self.target_hosts(&wwpns).await?;
        let hosts: Vec<u32> = online
            .into_iter()
            .filter(|h| targets.contains(h))
            .collect();

        if hosts.is_empty() {
            return Err(ConnectivityError::FcHostTargetNotFound {
                array_ids: array_ids.to_vec(),
            });
        }
        Ok(hosts)
    }

    pub async fn rescan(&self, lun: u32, array_ids: &[String]) -> Result<()> {
        let hosts = self.rescan_hosts(array_ids).await?;
        self.helper
            .rescan_devices(ConnectivityType::Fc, lun, array_ids, &hosts)
            .await
    }

    /// Succeeds when at least one online FC host has a remote port on the
    /// array; an online HBA that is not zoned to it does not count.
    pub async fn ensure_login(&self, array_ids: &[String]) -> Result<()> {
        let hosts = self.rescan_hosts(array_ids).await?;
        info!(hosts = ?hosts, "FC hosts connected to storage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rport_host_number() {
        assert_eq!(
            rport_host_number(Path::new("/sys/class/fc_remote_ports/rport-3:0-1/port_name")),
            Some(3)
        );
        assert_eq!(
            rport_host_number(Path::new(
                "/sys/bus/ccw/drivers/zfcp/0.0.1900/host0/rport-0:0-0/fc_remote_ports/rport-0:0-0/port_name"
            )),
            Some(0)
        );
        assert_eq!(
            rport_host_number(Path::new("/sys/class/fc_remote_ports/rport-x:0-1/port_name")),
            None
        );
        assert_eq!(rport_host_number(Path::new("port_name")), None);
    }

    #[test]
    fn test_remote_port_glob() {
        assert!(FcSubsystem::Scsi.remote_port_glob().starts_with("/sys/class/fc_remote_ports"));
        assert!(FcSubsystem::Ccw.remote_port_glob().starts_with("/sys/bus/ccw"));
    }
}
