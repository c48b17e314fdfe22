use super::*;
use crate::process::MockProcessController;
use crate::status::StoreStatusProvider;
use mediarelay_core::{
    config::RtmpConfig,
    models::{Camera, ServerRole, StreamType},
    repository::{MemoryCameraDirectory, MemoryStreamStore},
};
use std::sync::atomic::{AtomicU32, Ordering};

const LMS: &str = "lms-1";
const CMS: &str = "cms-1";

struct Harness {
    store: Arc<MemoryStreamStore>,
    orchestrator: StreamOrchestrator,
}

fn harness(processes: MockProcessController) -> Harness {
    harness_on(LMS, ServerRole::Lms, processes)
}

fn harness_on(server_id: &str, role: ServerRole, processes: MockProcessController) -> Harness {
    let store = Arc::new(MemoryStreamStore::new());
    let cameras = Arc::new(MemoryCameraDirectory::new());
    cameras.insert(Camera::new("c1", "u1", "Front"));
    cameras.insert(Camera::new("c2", "u1", "Back"));

    let orchestrator = StreamOrchestrator::new(
        OrchestratorSettings::new(server_id, role, RtmpConfig::default()),
        store.clone(),
        cameras,
        Arc::new(processes),
        Arc::new(StoreStatusProvider::new(store.clone())),
    );
    Harness {
        store,
        orchestrator,
    }
}

/// Processes that start with increasing pids and stay alive.
fn healthy_processes() -> MockProcessController {
    let next = Arc::new(AtomicU32::new(4000));
    let mut processes = MockProcessController::new();
    processes
        .expect_start()
        .returning(move |_, _| Ok(ProcessHandle::from_pid(next.fetch_add(1, Ordering::SeqCst))));
    processes.expect_is_running().returning(|_| Ok(true));
    processes.expect_kill().returning(|_| Ok(()));
    processes
}

fn draft(camera_id: &str, name: &str) -> RegisterDraft {
    RegisterDraft {
        camera_id: camera_id.to_string(),
        stream_name: name.to_string(),
        stream_url: format!("rtsp://10.0.0.5/{camera_id}/{name}"),
        is_public: true,
        stream_type: StreamType::Rtsp,
    }
}

#[tokio::test]
async fn test_register_creates_origin_and_running_hop() {
    let h = harness(healthy_processes());

    let lineage = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();

    let origin = &lineage.origin;
    assert_eq!(origin.stream_id, origin.provenance_stream_id);
    assert_eq!(origin.kind, StreamKind::Camera);
    assert_eq!(origin.source_server_id, LMS);
    assert_eq!(origin.destination_server_id, LMS);

    let hop = lineage.hop.unwrap();
    assert_eq!(hop.provenance_stream_id, origin.stream_id);
    assert_eq!(hop.kind, StreamKind::Rtmp);
    assert_eq!(hop.stream_type, StreamType::Rtmp);
    assert_eq!(hop.relay_state, HopState::Running);
    assert_eq!(hop.process_id, Some(4000));
    assert_eq!(
        hop.stream_url,
        format!("rtmp://localhost:1935/live/{}?token=", hop.stream_id)
    );
    assert_eq!(h.store.len(), 2);

    let stored = h
        .store
        .find_stream(&StreamFilter::new().stream_id(&hop.stream_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.process_id, Some(4000));
    assert_eq!(stored.relay_state, HopState::Running);
}

#[tokio::test]
async fn test_stream_ids_are_deterministic() {
    let h = harness(healthy_processes());
    let d = draft("c1", "front");

    let lineage = h.orchestrator.register_lineage("u1", &d).await.unwrap();

    assert_eq!(lineage.origin.stream_id, h.orchestrator.origin_id("u1", &d));
    assert_eq!(
        lineage.hop.unwrap().stream_id,
        h.orchestrator.hop_id(&lineage.origin.stream_id)
    );
    assert_ne!(
        h.orchestrator.origin_id("u1", &d),
        h.orchestrator.origin_id("u2", &d)
    );
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let h = harness(healthy_processes());
    h.orchestrator
        .register("u1", &[draft("c1", "front")])
        .await
        .unwrap();

    let err = h
        .orchestrator
        .register("u1", &[draft("c1", "front")])
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Conflict(_)));
    assert!(err.is_no_content());
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn test_in_batch_duplicate_writes_nothing() {
    let h = harness(healthy_processes());

    let err = h
        .orchestrator
        .register("u1", &[draft("c1", "front"), draft("c1", "front")])
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Conflict(_)));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_unknown_camera_fails_whole_batch() {
    let h = harness(healthy_processes());

    let err = h
        .orchestrator
        .register("u1", &[draft("c1", "front"), draft("c9", "side")])
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::NotFound(_)));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_invalid_draft_rejected() {
    let h = harness(healthy_processes());
    let mut bad = draft("c1", "front");
    bad.stream_url = "not a url".to_string();

    let err = h.orchestrator.register("u1", &[bad]).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidInput(_)));

    let err = h.orchestrator.register("u1", &[]).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidInput(_)));
}

#[tokio::test]
async fn test_register_batch_returns_views_in_order() {
    let h = harness(healthy_processes());

    let views = h
        .orchestrator
        .register("u1", &[draft("c1", "front"), draft("c2", "back")])
        .await
        .unwrap();

    assert_eq!(views.len(), 2);
    assert_eq!(views[0].camera_id, "c1");
    assert_eq!(views[1].camera_id, "c2");
    assert!(views.iter().all(|v| v.kind == StreamKind::Camera));
    assert_eq!(h.store.len(), 4);
}

#[tokio::test]
async fn test_failed_start_leaves_hop_for_retry() {
    let mut processes = MockProcessController::new();
    processes
        .expect_start()
        .returning(|_, _| Err(RelayError::ProcessStartFailed("ffmpeg: not found".to_string())));
    let h = harness(processes);

    let lineage = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();

    let hop = lineage.hop.unwrap();
    assert_eq!(hop.relay_state, HopState::Failed);
    assert_eq!(hop.process_id, None);
    assert!(!hop.is_publishing);

    let status = h.orchestrator.get_status(&hop.stream_id).await.unwrap();
    assert_eq!(status.relay_state, HopState::Failed);
}

/// Deletes every relay hop while its process starts, as a racing delete would.
struct HopVanishesOnStart {
    store: Arc<MemoryStreamStore>,
    killed: std::sync::Mutex<Vec<u32>>,
}

#[async_trait::async_trait]
impl ProcessController for HopVanishesOnStart {
    async fn start(&self, _input_url: &str, _output_url: &str) -> RelayResult<ProcessHandle> {
        self.store
            .delete_streams(&StreamFilter::new().kind(StreamKind::Rtmp))
            .await?;
        Ok(ProcessHandle::from_pid(777))
    }

    async fn is_running(&self, handle: ProcessHandle) -> RelayResult<bool> {
        Ok(!self.killed.lock().unwrap().contains(&handle.pid()))
    }

    async fn kill(&self, handle: ProcessHandle) -> RelayResult<()> {
        self.killed.lock().unwrap().push(handle.pid());
        Ok(())
    }
}

#[tokio::test]
async fn test_relay_for_vanished_hop_is_stopped() {
    let store = Arc::new(MemoryStreamStore::new());
    let cameras = Arc::new(MemoryCameraDirectory::new());
    cameras.insert(Camera::new("c1", "u1", "Front"));
    let processes = Arc::new(HopVanishesOnStart {
        store: store.clone(),
        killed: std::sync::Mutex::new(Vec::new()),
    });
    let orchestrator = StreamOrchestrator::new(
        OrchestratorSettings::new(LMS, ServerRole::Lms, RtmpConfig::default()),
        store.clone(),
        cameras,
        processes.clone(),
        Arc::new(StoreStatusProvider::new(store.clone())),
    );

    let lineage = orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();

    assert!(lineage.hop.is_none());
    assert_eq!(store.len(), 1);
    assert_eq!(*processes.killed.lock().unwrap(), vec![777]);

    let origin = lineage.origin;
    let err = orchestrator.publish_relay_hop(&origin).await.unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));
    assert_eq!(*processes.killed.lock().unwrap(), vec![777, 777]);
}

#[tokio::test]
async fn test_local_playback() {
    let h = harness(healthy_processes());
    let origin = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap()
        .origin;

    let plan = h
        .orchestrator
        .stream_request(&origin.stream_id, PlaybackKind::Local)
        .await
        .unwrap();

    assert!(plan.relay.is_none());
    assert_eq!(
        plan.answer.url_template,
        format!("rtmp://localhost:1935/live/{}?token=<TOKEN>", origin.stream_id)
    );
    assert!(!plan.answer.is_publishing);
    assert_eq!(plan.answer.message.as_deref(), Some(NOT_PUBLISHING_ADVISORY));

    let err = h
        .orchestrator
        .stream_request("missing", PlaybackKind::Local)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));
}

#[tokio::test]
async fn test_cloud_playback_targets_upstream_owner() {
    let cms = harness_on(CMS, ServerRole::Cms, healthy_processes());

    // mirror of an LMS hop, as left behind by a remote registration
    let draft = draft("c1", "front");
    let origin = StreamRecord::origin("s0".to_string(), "u1", LMS, &draft);
    let mut hop = StreamRecord::relay_hop(
        "h1".to_string(),
        &origin,
        LMS,
        LMS,
        "rtmp://lms/live/h1".to_string(),
    );
    hop.is_publishing = true;
    cms.store.register_streams(&[origin, hop]).await.unwrap();

    let plan = cms
        .orchestrator
        .stream_request("h1", PlaybackKind::Cloud)
        .await
        .unwrap();

    assert!(plan.answer.is_publishing);
    assert!(plan.answer.message.is_none());
    assert!(plan.answer.url_template.ends_with("/h1?token=<TOKEN>"));

    let relay = plan.relay.unwrap();
    assert_eq!(relay.server_id, LMS);
    assert_eq!(relay.data.cms_server_id, CMS);
    assert!(!relay.data.is_existing_stream);
    assert_eq!(relay.data.stream_data.stream_id, "h1");
    assert_eq!(relay.data.stream_data.destination_server_id, LMS);
}

#[tokio::test]
async fn test_cloud_playback_with_existing_pull() {
    let cms = harness_on(CMS, ServerRole::Cms, healthy_processes());
    let draft = draft("c1", "front");
    let origin = StreamRecord::origin("s0".to_string(), "u1", LMS, &draft);
    let hop = StreamRecord::relay_hop("h1".to_string(), &origin, LMS, LMS, "rtmp://lms/h1".to_string());
    let pulled = StreamRecord::relay_hop("h1".to_string(), &hop, LMS, CMS, "rtmp://cms/h1".to_string());
    cms.store.register_streams(&[origin, hop, pulled]).await.unwrap();

    let plan = cms
        .orchestrator
        .stream_request("h1", PlaybackKind::Cloud)
        .await
        .unwrap();

    let relay = plan.relay.unwrap();
    assert!(relay.data.is_existing_stream);
    assert_eq!(relay.data.stream_data.destination_server_id, LMS);
}

#[tokio::test]
async fn test_publish_to_upstream_reuses_running_relay() {
    let h = harness(healthy_processes());
    let hop = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap()
        .hop
        .unwrap();

    let request = RelayRequestData {
        cms_server_id: CMS.to_string(),
        is_existing_stream: false,
        stream_data: hop.clone(),
    };
    let first = h.orchestrator.publish_to_upstream(&request).await.unwrap();
    let second = h.orchestrator.publish_to_upstream(&request).await.unwrap();

    assert_eq!(first.stream_id, hop.stream_id);
    assert_eq!(first.source_server_id, hop.destination_server_id);
    assert_eq!(first.destination_server_id, CMS);
    assert_eq!(first.provenance_stream_id, hop.provenance_stream_id);
    assert_eq!(
        first.stream_url,
        format!("rtmp://localhost:1935/live/{}?token=", hop.stream_id)
    );
    assert_eq!(first.relay_state, HopState::Running);
    assert_eq!(second.process_id, first.process_id);
    assert_eq!(h.store.len(), 3);
    assert!(h.orchestrator.relay_locks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_relay_requests_start_one_process() {
    let h = Arc::new(harness(healthy_processes()));
    let hop = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap()
        .hop
        .unwrap();
    let request = RelayRequestData {
        cms_server_id: CMS.to_string(),
        is_existing_stream: false,
        stream_data: hop,
    };

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = Arc::clone(&h);
        let request = request.clone();
        tasks.push(tokio::spawn(async move {
            h.orchestrator.publish_to_upstream(&request).await.unwrap()
        }));
    }
    let mut pids = HashSet::new();
    for task in tasks {
        pids.insert(task.await.unwrap().process_id);
    }

    assert_eq!(pids.len(), 1);
    assert_eq!(h.store.len(), 3);
}

#[tokio::test]
async fn test_publish_to_upstream_unknown_hop() {
    let h = harness(healthy_processes());
    let draft = draft("c1", "front");
    let origin = StreamRecord::origin("s0".to_string(), "u1", LMS, &draft);

    let err = h
        .orchestrator
        .publish_to_upstream(&RelayRequestData {
            cms_server_id: CMS.to_string(),
            is_existing_stream: false,
            stream_data: origin,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_stops_relays_and_removes_lineage() {
    let mut processes = MockProcessController::new();
    let next = Arc::new(AtomicU32::new(100));
    processes
        .expect_start()
        .returning(move |_, _| Ok(ProcessHandle::from_pid(next.fetch_add(1, Ordering::SeqCst))));
    processes.expect_is_running().returning(|_| Ok(true));
    processes
        .expect_kill()
        .times(2)
        .returning(|_| Ok(()));
    let h = harness(processes);

    let lineage = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();
    let hop = lineage.hop.unwrap();
    h.orchestrator
        .publish_to_upstream(&RelayRequestData {
            cms_server_id: CMS.to_string(),
            is_existing_stream: false,
            stream_data: hop,
        })
        .await
        .unwrap();
    assert_eq!(h.store.len(), 3);

    let outcome = h.orchestrator.delete(&lineage.origin.stream_id).await.unwrap();

    assert_eq!(outcome.rows_affected, 3);
    assert!(outcome.process_failures.is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_delete_continues_past_kill_failure() {
    let mut processes = MockProcessController::new();
    processes
        .expect_start()
        .returning(|_, _| Ok(ProcessHandle::from_pid(77)));
    processes.expect_is_running().returning(|_| Ok(true));
    processes
        .expect_kill()
        .returning(|_| Err(RelayError::OrchestrationFailed("permission denied".to_string())));
    let h = harness(processes);

    let lineage = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();

    let outcome = h.orchestrator.delete(&lineage.origin.stream_id).await.unwrap();

    assert_eq!(outcome.rows_affected, 2);
    assert_eq!(outcome.process_failures.len(), 1);
    assert_eq!(outcome.process_failures[0].handle, ProcessHandle::from_pid(77));
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_delete_skips_kill_for_dead_process() {
    let mut processes = MockProcessController::new();
    processes
        .expect_start()
        .returning(|_, _| Ok(ProcessHandle::from_pid(55)));
    processes.expect_is_running().returning(|_| Ok(false));
    processes.expect_kill().never();
    let h = harness(processes);

    let lineage = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();

    let outcome = h.orchestrator.delete(&lineage.origin.stream_id).await.unwrap();
    assert_eq!(outcome.rows_affected, 2);
    assert!(outcome.process_failures.is_empty());
}

#[tokio::test]
async fn test_delete_unknown_or_hop_id_is_noop() {
    let h = harness(healthy_processes());
    let hop = h
        .orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap()
        .hop
        .unwrap();

    assert!(h.orchestrator.delete("missing").await.unwrap().is_noop());
    assert!(h.orchestrator.delete(&hop.stream_id).await.unwrap().is_noop());
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn test_find_one_and_find_all() {
    let h = harness(healthy_processes());
    let views = h
        .orchestrator
        .register("u1", &[draft("c1", "front"), draft("c2", "back")])
        .await
        .unwrap();

    let found = h.orchestrator.find_one(&views[0].stream_id).await.unwrap();
    assert_eq!(found.as_ref(), Some(&views[0]));
    assert!(h.orchestrator.find_one("missing").await.unwrap().is_none());

    let page = h
        .orchestrator
        .find_all(PageParams::new(Some(2), Some(3)))
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 1);
    assert!(!page.has_next());
}

#[tokio::test]
async fn test_get_status_unknown_stream() {
    let h = harness(healthy_processes());
    let err = h.orchestrator.get_status("missing").await.unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_lineage_with_real_relay_processes() {
    use crate::process::RelayProcessManager;
    use mediarelay_core::config::RelayConfig;

    let store = Arc::new(MemoryStreamStore::new());
    let cameras = Arc::new(MemoryCameraDirectory::new());
    cameras.insert(Camera::new("c1", "u1", "Front"));
    let processes = Arc::new(RelayProcessManager::new(&RelayConfig {
        program: "sleep".to_string(),
        args: vec!["30".to_string()],
        stop_timeout_ms: 2000,
    }));
    let orchestrator = StreamOrchestrator::new(
        OrchestratorSettings::new(LMS, ServerRole::Lms, RtmpConfig::default()),
        store.clone(),
        cameras,
        processes.clone(),
        Arc::new(StoreStatusProvider::new(store.clone())),
    );

    let lineage = orchestrator
        .register_lineage("u1", &draft("c1", "front"))
        .await
        .unwrap();
    let hop = lineage.hop.unwrap();
    let pid = ProcessHandle::from_pid(hop.process_id.unwrap());
    assert!(processes.is_running(pid).await.unwrap());

    let outcome = orchestrator.delete(&lineage.origin.stream_id).await.unwrap();

    assert_eq!(outcome.rows_affected, 2);
    assert!(outcome.process_failures.is_empty());
    assert!(orchestrator.find_one(&lineage.origin.stream_id).await.unwrap().is_none());
    assert!(orchestrator.find_one(&hop.stream_id).await.unwrap().is_none());
    assert!(!processes.is_running(pid).await.unwrap());
    assert_eq!(processes.tracked(), 0);
}
