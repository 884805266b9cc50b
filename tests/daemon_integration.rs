/// 데몬 기동 경로 통합 테스트
/// 설정 로드 → 저장소 열기 → 재연결(reconcile) 순서를 검증

use hearth_core::config::GlobalConfig;
use hearth_core::instance::{DescriptorStore, InstanceStore, RunState, ServerDescriptor};
use hearth_core::supervisor::{Supervisor, SupervisorOptions};
use serde_json::Value;
use std::fs;
use std::sync::Arc;

fn write_instances(path: &std::path::Path, descriptors: &[ServerDescriptor]) {
    fs::write(path, serde_json::to_string_pretty(descriptors).unwrap()).unwrap();
}

#[tokio::test]
async fn test_supervisor_initialization_resets_stale_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("instances.json");

    let mut stale = ServerDescriptor::new("test-stale", "/srv/a");
    stale.run_state = RunState::Running;
    stale.process_id = Some(u32::MAX / 2 - 21);
    let idle = ServerDescriptor::new("test-idle", "/srv/b");
    write_instances(&path, &[stale.clone(), idle.clone()]);

    let store = Arc::new(InstanceStore::open(&path).unwrap());
    let supervisor = Supervisor::new(store.clone(), SupervisorOptions::default());
    assert!(supervisor.initialize().await.is_ok(), "Supervisor should initialize without error");

    let after = store.load(&stale.id).unwrap().unwrap();
    assert_eq!(after.run_state, RunState::Stopped);
    assert_eq!(after.process_id, None);

    // 디스크에도 반영되어야 다음 기동 때 다시 정리하지 않음
    let on_disk: Vec<Value> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let entry = on_disk.iter().find(|v| v["id"] == stale.id.as_str()).unwrap();
    assert_eq!(entry["run_state"], "stopped");
    assert!(entry["process_id"].is_null());

    println!("✓ Supervisor initialization test passed");
}

#[tokio::test]
async fn test_store_tolerates_missing_optional_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("instances.json");
    fs::write(
        &path,
        r#"[{ "id": "legacy-1", "name": "test-legacy", "server_root": "/srv/legacy" }]"#,
    )
    .unwrap();

    let store = InstanceStore::open(&path).unwrap();
    let d = store.load("legacy-1").unwrap().unwrap();
    assert_eq!(d.port, 5520);
    assert_eq!(d.bind_address, "0.0.0.0");
    assert_eq!(d.min_memory_mb, 2048);
    assert_eq!(d.max_memory_mb, 4096);
    assert!(d.use_aot_cache);
    assert_eq!(d.run_state, RunState::Stopped);
}

#[tokio::test]
async fn test_corrupt_store_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("instances.json");
    fs::write(&path, "{ not json").unwrap();
    assert!(InstanceStore::open(&path).is_err());
}

#[tokio::test]
async fn test_config_drives_supervisor_options() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg_path = tmp.path().join("global.toml");
    fs::write(
        &cfg_path,
        "console_buffer_size = 3\ntrust_unverifiable_process = false\n",
    )
    .unwrap();

    let cfg = GlobalConfig::load_from(&cfg_path).unwrap();
    let options = SupervisorOptions::from(&cfg);
    assert_eq!(options.console_buffer_lines, 3);
    assert!(!options.trust_unverifiable_process);

    let store = Arc::new(InstanceStore::new(tmp.path().join("instances.json")));
    let d = ServerDescriptor::new("test-buffer", tmp.path().join("srv"));
    store.save(&d).unwrap();
    let supervisor = Supervisor::new(store, options);

    // 링 버퍼 크기가 설정값을 따름
    for _ in 0..5 {
        let _ = supervisor.start(&d.id).await;
    }
    assert_eq!(supervisor.recent_console(&d.id, 100).unwrap().len(), 3);
}

#[tokio::test]
async fn test_concurrent_reads() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(InstanceStore::new(tmp.path().join("instances.json")));
    for i in 0..4 {
        store
            .save(&ServerDescriptor::new(&format!("test-{}", i), "/srv"))
            .unwrap();
    }
    let supervisor = Arc::new(Supervisor::new(store, SupervisorOptions::default()));

    let mut handles = vec![];
    for _ in 0..10 {
        let sup = supervisor.clone();
        handles.push(tokio::spawn(async move {
            let list = sup.list().unwrap();
            for d in &list {
                assert!(sup.probe(&d.id).await.is_ok());
            }
            list.len()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 4);
    }
    println!("✓ Concurrent access test passed");
}
