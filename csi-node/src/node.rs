//! Node Service Implementation
//!
//! Attaches and detaches array volumes on this host. Staging rescans the
//! SCSI hosts connected to the array and resolves the volume to its dm
//! multipath device; unstaging flushes that device and deletes its paths.
//! Mounting the resulting device is left to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use device_connectivity::{
    Connectivity, ConnectivityError, ConnectivityOptions, ConnectivityType, Executor,
    VolumeLockGuard, VolumeLocks,
};
use tonic::Status;
use tracing::{info, instrument, warn};

use crate::error::{NodeError, Result};
use crate::metrics::{self, OperationTimer};
use crate::types::{StageRequest, StageResponse, UnstageRequest, UnstageResponse};

pub struct NodeService {
    node_id: String,
    connectivity: HashMap<ConnectivityType, Connectivity>,
    locks: Arc<VolumeLocks>,
}

impl NodeService {
    /// Build one façade per transport, all sharing `executor` and the
    /// process-wide flush lock in `options`.
    pub fn new(node_id: String, executor: Arc<dyn Executor>, options: ConnectivityOptions) -> Self {
        let connectivity = ConnectivityType::ALL
            .into_iter()
            .map(|kind| (kind, Connectivity::new(kind, Arc::clone(&executor), &options)))
            .collect();
        Self {
            node_id,
            connectivity,
            locks: Arc::new(VolumeLocks::new()),
        }
    }

    /// Share a volume lock table with other services in the process.
    pub fn with_locks(mut self, locks: Arc<VolumeLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn locks(&self) -> &Arc<VolumeLocks> {
        &self.locks
    }

    fn connectivity(&self, kind: ConnectivityType) -> Result<&Connectivity> {
        self.connectivity.get(&kind).ok_or_else(|| {
            NodeError::Connectivity(ConnectivityError::UnsupportedConnectivityType(
                kind.to_string(),
            ))
        })
    }

    fn lock(&self, operation: &str, volume_id: &str) -> Result<VolumeLockGuard> {
        self.locks.acquire(volume_id).map_err(|e| {
            metrics::record_volume_busy(operation);
            NodeError::from(e)
        })
    }

    /// Complete `timer` and convert the outcome for the RPC boundary.
    fn finish<T>(timer: OperationTimer, result: Result<T>) -> std::result::Result<T, Status> {
        match result {
            Ok(value) => {
                timer.success();
                Ok(value)
            }
            Err(e) => {
                let status = Status::from(e);
                timer.failure(&status.code().to_string());
                Err(status)
            }
        }
    }

    /// Attach a volume and return its multipath device path.
    pub async fn stage_volume(
        &self,
        req: &StageRequest,
    ) -> std::result::Result<StageResponse, Status> {
        let timer = OperationTimer::new("stage_volume");
        let result = self.stage(req).await;
        Self::finish(timer, result)
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id(), transport = %req.connectivity_type))]
    async fn stage(&self, req: &StageRequest) -> Result<StageResponse> {
        let _guard = self.lock("stage_volume", req.volume_id())?;
        info!(
            lun = req.lun,
            array_identifiers = %req.array_identifiers,
            staging_target_path = %req.staging_target_path,
            "Stage request"
        );

        let connectivity = self.connectivity(req.connectivity_type)?;
        connectivity
            .rescan_devices(req.lun, req.array_identifiers.as_slice())
            .await?;
        let device_path = connectivity.get_mpath_device(&req.volume).await?;

        info!(device = %device_path, "Volume staged");
        Ok(StageResponse {
            volume_id: req.volume_id().to_string(),
            device_path,
            staging_target_path: req.staging_target_path.clone(),
        })
    }

    /// Detach a volume; succeeds if it is already gone.
    pub async fn unstage_volume(
        &self,
        req: &UnstageRequest,
    ) -> std::result::Result<UnstageResponse, Status> {
        let timer = OperationTimer::new("unstage_volume");
        let result = self.unstage(req).await;
        Self::finish(timer, result)
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id(), transport = %req.connectivity_type))]
    async fn unstage(&self, req: &UnstageRequest) -> Result<UnstageResponse> {
        let _guard = self.lock("unstage_volume", req.volume_id())?;
        info!(staging_target_path = %req.staging_target_path, "Unstage request");

        let connectivity = self.connectivity(req.connectivity_type)?;
        let Some(dm) = connectivity.find_mpath_device(&req.volume).await? else {
            warn!("No multipath device for volume, nothing to unstage");
            return Ok(UnstageResponse {
                volume_id: req.volume_id().to_string(),
                device_path: None,
                removed_devices: Vec::new(),
            });
        };

        // Slaves disappear from sysfs once the map is flushed.
        let slaves = connectivity.get_slave_devices(&dm.name).await?;
        connectivity.flush_multipath_device(&dm.name).await?;
        connectivity.remove_physical_device(&slaves).await?;

        info!(device = %dm, slaves = slaves.len(), "Volume unstaged");
        Ok(UnstageResponse {
            volume_id: req.volume_id().to_string(),
            device_path: Some(dm.path_string()),
            removed_devices: slaves.into_iter().map(|s| s.name).collect(),
        })
    }

    /// Rescan the hosts connected to `array_ids` for `lun`.
    pub async fn rescan(
        &self,
        connectivity_type: ConnectivityType,
        lun: u32,
        array_ids: &[String],
    ) -> std::result::Result<(), Status> {
        let timer = OperationTimer::new("rescan");
        let result = match self.connectivity(connectivity_type) {
            Ok(c) => c.rescan_devices(lun, array_ids).await.map_err(NodeError::from),
            Err(e) => Err(e),
        };
        Self::finish(timer, result)
    }

    /// Flush a dm device outside of an unstage.
    pub async fn flush(&self, dm_name: &str) -> std::result::Result<(), Status> {
        let timer = OperationTimer::new("flush");
        // Flush does not depend on the transport.
        let result = match self.connectivity(ConnectivityType::Iscsi) {
            Ok(c) => c.flush_multipath_device(dm_name).await.map_err(NodeError::from),
            Err(e) => Err(e),
        };
        Self::finish(timer, result)
    }

    /// Check that this host is connected to the array.
    pub async fn ensure_login(
        &self,
        connectivity_type: ConnectivityType,
        array_ids: &[String],
    ) -> std::result::Result<(), Status> {
        let timer = OperationTimer::new("ensure_login");
        let result = match self.connectivity(connectivity_type) {
            Ok(c) => c.ensure_login(array_ids).await.map_err(NodeError::from),
            Err(e) => Err(e),
        };
        Self::finish(timer, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_connectivity::SystemExecutor;

    fn service() -> NodeService {
        NodeService::new(
            "test-node-1".to_string(),
            Arc::new(SystemExecutor::new()),
            ConnectivityOptions::default(),
        )
    }

    #[test]
    fn test_node_service_creation() {
        let service = service();
        assert_eq!(service.node_id(), "test-node-1");
        for kind in ConnectivityType::ALL {
            assert_eq!(service.connectivity(kind).unwrap().connectivity_type(), kind);
        }
        assert!(service.locks().is_empty());
    }

    #[test]
    fn test_busy_volume_maps_to_aborted() {
        let service = service();
        let _held = service.locks().acquire("vol1").unwrap();
        let err = service.lock("stage_volume", "vol1").unwrap_err();
        assert_eq!(Status::from(err).code(), tonic::Code::Aborted);
    }

    #[tokio::test]
    async fn test_flush_rejects_bad_name_before_running_anything() {
        let status = service().flush("../../etc").await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
