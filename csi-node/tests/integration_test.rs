//! Integration tests for the node service
//!
//! Stage and unstage run end to end against the scripted host from
//! `device-connectivity-testing`, checking the control flow, locking and the
//! status codes the orchestrator sees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use csi_node::{NodeService, StageRequest, UnstageRequest};
use device_connectivity::{ConnectivityOptions, ConnectivityType, Executor, FcSubsystem};
use device_connectivity_testing::{FakeExecutor, RECONFIGURE, Reply, SHOW_MAPS};
use tonic::Code;

const UUID: &str = "6oui000vendorsi0vendorsie0000000";
const NGUID: &str = "vendorsie0000000oui0000vendorsi0";
const OTHER_UUID: &str = "6oui000vendorsi0vendorsie0000001";
const IQN: &str = "iqn.1986-03.com.ibm:2145.v7k194.node2";
const STAGING: &str = "/var/lib/kubelet/plugins/staging/pv1";

fn service(fake: &Arc<FakeExecutor>) -> NodeService {
    let options = ConnectivityOptions {
        fc_subsystem: FcSubsystem::Scsi,
        ..ConnectivityOptions::default()
    };
    NodeService::new(
        "node-1".to_string(),
        Arc::clone(fake) as Arc<dyn Executor>,
        options,
    )
}

fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn iscsi_stage(volume_id: &str) -> StageRequest {
    let ctx = context(&[
        ("connectivity_type", "iscsi"),
        ("lun", "0"),
        ("array_iqn", IQN),
    ]);
    StageRequest::from_context(volume_id, STAGING, &ctx).unwrap()
}

fn unstage(volume_id: &str) -> UnstageRequest {
    let ctx = context(&[("connectivityType", "iscsi")]);
    UnstageRequest::from_context(volume_id, STAGING, &ctx).unwrap()
}

fn sg_inq_output(wwn: &str) -> String {
    format!(
        "VPD INQUIRY: Device Identification page\n      Vendor Specific Identifier Extension: 0xcea\n\t\t\t  [0x{}]\n",
        wwn
    )
}

// ============================================================================
// Stage
// ============================================================================

#[tokio::test]
async fn test_stage_iscsi_volume() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_iscsi_session(1, 1, IQN)
        .add_iscsi_session(2, 2, IQN)
        .add_dm("dm-1", &["sdb", "sdc"])
        .reply(SHOW_MAPS, Reply::ok(&format!("dm-1,{}\n", UUID)));
    let service = service(&fake);

    let resp = service.stage_volume(&iscsi_stage(UUID)).await.unwrap();
    assert_eq!(resp.device_path, "/dev/dm-1");
    assert_eq!(resp.volume_id, UUID);
    assert_eq!(resp.staging_target_path, STAGING);
    assert_eq!(fake.writes_to("/sys/class/scsi_host/host1/scan"), vec!["0 0 0"]);
    assert_eq!(fake.writes_to("/sys/class/scsi_host/host2/scan"), vec!["0 0 0"]);
    assert!(service.locks().is_empty());
}

#[tokio::test]
async fn test_stage_fc_volume_after_reload() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_fc_host(1, "Online")
        .add_fc_rport(1, 0, "0x500507680b21ac5c")
        .reply(SHOW_MAPS, Reply::ok(""))
        .reply(SHOW_MAPS, Reply::ok(&format!("dm-3,{}\n", NGUID)))
        .reply(RECONFIGURE, Reply::ok(""))
        .reply("sg_inq -p 0x83 /dev/dm-3", Reply::ok(&sg_inq_output(UUID)));
    let service = service(&fake);

    let ctx = context(&[
        ("connectivityType", "fc"),
        ("lun", "12"),
        ("arrayWwpns", "500507680B21AC5C"),
        ("nguid", NGUID),
    ]);
    let req = StageRequest::from_context(UUID, STAGING, &ctx).unwrap();

    let resp = service.stage_volume(&req).await.unwrap();
    assert_eq!(resp.device_path, "/dev/dm-3");
    assert_eq!(fake.writes_to("/sys/class/scsi_host/host1/scan"), vec!["0 0 12"]);
}

#[tokio::test]
async fn test_stage_wrong_device_is_internal_and_releases_lock() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_iscsi_session(1, 1, IQN)
        .reply(SHOW_MAPS, Reply::ok(""))
        .reply(SHOW_MAPS, Reply::ok(&format!("dm-4,{}\n", UUID)))
        .reply(RECONFIGURE, Reply::ok(""))
        .reply(
            "sg_inq -p 0x83 /dev/dm-4",
            Reply::ok(&sg_inq_output("deadbeefdeadbeefdeadbeefdeadbeef")),
        );
    let service = service(&fake);

    let status = service.stage_volume(&iscsi_stage(UUID)).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("dm-4"));
    assert!(!service.locks().is_locked(UUID));
}

#[tokio::test]
async fn test_stage_without_session_is_not_found() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_iscsi_session(1, 1, "iqn.2000-01.com.example:other");
    let service = service(&fake);

    let status = service.stage_volume(&iscsi_stage(UUID)).await.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(fake.count_calls(SHOW_MAPS), 0);
}

#[tokio::test]
async fn test_stage_ambiguous_device_is_failed_precondition() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_iscsi_session(1, 1, IQN).reply(
        SHOW_MAPS,
        Reply::ok(&format!("{u},dm-1\n{u},dm-2\n", u = UUID)),
    );
    let service = service(&fake);

    let status = service.stage_volume(&iscsi_stage(UUID)).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(fake.count_calls("sg_inq"), 0);
}

/// The second request for a busy volume is rejected before it touches the host.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stage_same_volume_is_aborted() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_iscsi_session(1, 1, IQN)
        .add_dm("dm-1", &["sdb", "sdc"])
        .reply(SHOW_MAPS, Reply::ok(&format!("{},dm-1\n", UUID)))
        .delay("multipathd", Duration::from_millis(150));
    let service = Arc::new(service(&fake));

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.stage_volume(&iscsi_stage(UUID)).await })
    };
    while !service.locks().is_locked(UUID) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = service.stage_volume(&iscsi_stage(UUID)).await.unwrap_err();
    assert_eq!(status.code(), Code::Aborted);

    let resp = first.await.unwrap().unwrap();
    assert_eq!(resp.device_path, "/dev/dm-1");
    assert_eq!(fake.writes_to("/sys/class/scsi_host/host1/scan").len(), 1);
    assert_eq!(fake.count_calls(SHOW_MAPS), 1);
    assert!(service.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_volumes_stage_in_parallel() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_iscsi_session(1, 1, IQN)
        .add_dm("dm-1", &["sdb", "sdc"])
        .add_dm("dm-2", &["sdd", "sde"])
        .reply(
            SHOW_MAPS,
            Reply::ok(&format!("{},dm-1\n{},dm-2\n", UUID, OTHER_UUID)),
        )
        .delay("multipathd", Duration::from_millis(50));
    let service = Arc::new(service(&fake));

    let requests = [iscsi_stage(UUID), iscsi_stage(OTHER_UUID)];
    let results =
        futures::future::join_all(requests.iter().map(|req| service.stage_volume(req))).await;

    let devices: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().device_path)
        .collect();
    assert_eq!(devices, vec!["/dev/dm-1", "/dev/dm-2"]);
    assert_eq!(fake.max_running(), 2);
}

// ============================================================================
// Unstage
// ============================================================================

#[tokio::test]
async fn test_unstage_flushes_and_removes_paths() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_dm("dm-1", &["sdb", "sdc"])
        .reply(SHOW_MAPS, Reply::ok(&format!("{},dm-1\n", UUID)))
        .reply("multipath -f /dev/dm-1", Reply::ok(""));
    let service = service(&fake);

    let resp = service.unstage_volume(&unstage(UUID)).await.unwrap();
    assert_eq!(resp.device_path.as_deref(), Some("/dev/dm-1"));
    assert_eq!(resp.removed_devices, vec!["sdb", "sdc"]);

    let calls = fake.calls();
    assert_eq!(calls, vec![SHOW_MAPS.to_string(), "multipath -f /dev/dm-1".to_string()]);
    assert_eq!(fake.writes_to("/sys/block/sdb/device/delete"), vec!["1"]);
    assert_eq!(fake.writes_to("/sys/block/sdc/device/delete"), vec!["1"]);
}

#[tokio::test]
async fn test_unstage_already_gone_volume_succeeds() {
    let fake = Arc::new(FakeExecutor::new());
    fake.reply(SHOW_MAPS, Reply::ok("3600aaaa00000000000000000000000ff,dm-0\n"));
    let service = service(&fake);

    let resp = service.unstage_volume(&unstage(UUID)).await.unwrap();
    assert!(resp.device_path.is_none());
    assert!(resp.removed_devices.is_empty());
    assert_eq!(fake.count_calls(RECONFIGURE), 0);
    assert_eq!(fake.count_calls("multipath -f"), 0);
    assert!(fake.writes().is_empty());
}

#[tokio::test]
async fn test_unstage_flush_failure_keeps_paths() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_dm("dm-1", &["sdb"])
        .reply(SHOW_MAPS, Reply::ok(&format!("{},dm-1\n", UUID)))
        .reply("multipath -f /dev/dm-1", Reply::fail(1, "map in use"));
    let service = service(&fake);

    let status = service.unstage_volume(&unstage(UUID)).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(fake.writes().is_empty());
    assert!(service.locks().is_empty());
}

// ============================================================================
// Operator commands
// ============================================================================

#[tokio::test]
async fn test_flush_vanished_device() {
    let fake = Arc::new(FakeExecutor::new());
    fake.reply("multipath -f /dev/dm-9", Reply::fail(1, "no such map"));
    let service = service(&fake);

    service.flush("dm-9").await.unwrap();
}

#[tokio::test]
async fn test_rescan_requires_array_ids() {
    let fake = Arc::new(FakeExecutor::new());
    let service = service(&fake);

    let status = service
        .rescan(ConnectivityType::Iscsi, 0, &[])
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_ensure_login_fc_offline_is_not_found() {
    let fake = Arc::new(FakeExecutor::new());
    fake.add_fc_host(1, "Linkdown")
        .add_fc_rport(1, 0, "0xaabbccdd");
    let service = service(&fake);

    let status = service
        .ensure_login(ConnectivityType::Fc, &["aabbccdd".to_string()])
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    service
        .ensure_login(ConnectivityType::NvmeOfc, &[])
        .await
        .unwrap();
}
