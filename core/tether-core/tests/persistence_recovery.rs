//! Storage behavior across process restarts: each test builds a fresh
//! `PersistenceStore` over the same directory so nothing comes from the
//! in-memory cache.

use std::collections::BTreeMap;
use std::fs;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tether_core::{
    load_engine_config, save_engine_config, Engine, EngineConfig, Message, PersistenceStore,
    ProjectDescriptor, PushOutcome, Sender, StorageConfig, StreamingState,
};
use tether_protocol::AnyValue;

fn storage(temp: &TempDir) -> StorageConfig {
    StorageConfig::with_root(temp.path().to_path_buf())
}

fn reopen(temp: &TempDir) -> PersistenceStore {
    PersistenceStore::new(storage(temp))
}

fn message(id: &str, minute: u32) -> Message {
    Message {
        id: id.to_string(),
        content: format!("content {id}"),
        sender: Sender::Assistant,
        timestamp: Utc
            .with_ymd_and_hms(2026, 1, 30, 12, minute, 0)
            .single()
            .expect("valid timestamp"),
        session_metadata: None,
        streaming_state: StreamingState::Completed,
    }
}

fn quarantined_files(dir: &std::path::Path) -> Vec<String> {
    fs::read_dir(dir)
        .expect("Failed to read project dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".corrupt-"))
        .collect()
}

#[test]
fn metadata_survives_restart() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let project = ProjectDescriptor::from_path("/code/app");

    let saved = reopen(&temp)
        .save(&project.id, &[message("a", 0), message("b", 1)], "remote-1", &project)
        .expect("Failed to save");

    let store = reopen(&temp);
    let record = store
        .get_metadata(&project.id)
        .expect("metadata should survive restart");
    assert_eq!(record.session_id, saved.session_id);
    assert_eq!(record.remote_session_id.as_deref(), Some("remote-1"));
    assert_eq!(record.message_count, 2);
    assert_eq!(store.load(&project.id, "remote-1").len(), 2);
}

#[test]
fn corrupt_message_file_loads_empty_and_is_kept() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let project = ProjectDescriptor::from_path("/code/app");
    let store = reopen(&temp);
    store
        .save(&project.id, &[message("a", 0)], "remote-1", &project)
        .expect("Failed to save");

    let path = store.storage().messages_file(&project.id, "remote-1");
    fs::write(&path, "{\"version\": 1, \"messages\": [").expect("Failed to corrupt file");

    let store = reopen(&temp);
    assert!(store.load(&project.id, "remote-1").is_empty());
    assert!(!path.exists());

    let quarantined = quarantined_files(&store.storage().project_dir(&project.id));
    assert_eq!(quarantined.len(), 1);
    assert!(quarantined[0].starts_with("remote-1_messages.json.corrupt-"));

    // The next save starts clean next to the quarantined copy.
    store
        .save(&project.id, &[message("b", 1)], "remote-1", &project)
        .expect("Failed to save after quarantine");
    assert_eq!(store.load(&project.id, "remote-1")[0].id, "b");
}

#[test]
fn corrupt_metadata_is_quarantined_and_reads_as_none() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let project = ProjectDescriptor::from_path("/code/app");
    let store = reopen(&temp);
    store
        .save(&project.id, &[message("a", 0)], "remote-1", &project)
        .expect("Failed to save");
    fs::write(store.storage().metadata_file(&project.id), "not json")
        .expect("Failed to corrupt metadata");

    let store = reopen(&temp);
    assert!(store.get_metadata(&project.id).is_none());
    assert_eq!(
        quarantined_files(&store.storage().project_dir(&project.id)).len(),
        1
    );
}

#[test]
fn metadata_pointing_at_missing_messages_is_purged() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let project = ProjectDescriptor::from_path("/code/app");
    let store = reopen(&temp);
    store
        .save(&project.id, &[message("a", 0)], "remote-1", &project)
        .expect("Failed to save");
    fs::remove_file(store.storage().messages_file(&project.id, "remote-1"))
        .expect("Failed to remove messages");

    let store = reopen(&temp);
    assert!(store.get_metadata(&project.id).is_none());
    assert!(!store.storage().metadata_file(&project.id).exists());
}

#[test]
fn archive_moves_current_session_aside() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let project = ProjectDescriptor::from_path("/code/app");
    let store = reopen(&temp);
    store
        .save(&project.id, &[message("a", 0)], "remote-1", &project)
        .expect("Failed to save");

    let archived = store.archive(&project.id).expect("Failed to archive");
    assert_eq!(archived.len(), 2);
    assert!(store.get_metadata(&project.id).is_none());
    assert!(store.load(&project.id, "remote-1").is_empty());
    let listed = store
        .list_archives(&project.id)
        .expect("Failed to list archives");
    assert_eq!(listed.len(), 1);
    assert!(archived.contains(&listed[0]));
}

#[test]
fn clear_removes_everything_for_project() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let project = ProjectDescriptor::from_path("/code/app");
    let other = ProjectDescriptor::from_path("/code/other");
    let store = reopen(&temp);
    store
        .save(&project.id, &[message("a", 0)], "remote-1", &project)
        .expect("Failed to save");
    store
        .save(&other.id, &[message("b", 0)], "remote-2", &other)
        .expect("Failed to save");

    store.clear(&project.id).expect("Failed to clear");
    assert!(store.get_metadata(&project.id).is_none());
    assert!(store.get_metadata(&other.id).is_some());
    // Clearing twice is fine.
    store.clear(&project.id).expect("Failed to clear again");
}

#[test]
fn config_round_trip_drops_secret() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let storage = storage(&temp);
    let config = EngineConfig {
        endpoint: Some("ws://10.0.0.5:3001/ws".into()),
        auth_token: Some("secret".into()),
        chat_timeout_ms: 45_000,
        ..EngineConfig::default()
    };
    save_engine_config(&storage, &config).expect("Failed to save config");

    let written = fs::read_to_string(storage.config_file()).expect("Failed to read config");
    assert!(!written.contains("secret"));

    let loaded = load_engine_config(&storage);
    assert_eq!(loaded.chat_timeout_ms, 45_000);
    assert_eq!(loaded.endpoint.as_deref(), Some("ws://10.0.0.5:3001/ws"));
}

#[tokio::test]
async fn push_is_stored_while_offline() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let engine = Engine::new(EngineConfig::default(), storage(&temp));

    let mut push = BTreeMap::new();
    push.insert("sessionId".to_string(), AnyValue::from("s-1"));
    push.insert("message".to_string(), AnyValue::from("Deploy finished"));
    push.insert("projectPath".to_string(), AnyValue::from("/code/app"));

    let outcome = engine.handle_push(push).await.expect("Failed to handle push");
    let project = ProjectDescriptor::from_path("/code/app");
    assert_eq!(
        outcome,
        PushOutcome::Stored {
            project_id: project.id.clone(),
            session_id: "s-1".into(),
            message_count: 1,
            fetched: 0,
        }
    );

    let resumed = engine
        .resume_session(&project)
        .await
        .expect("Failed to read metadata");
    assert_eq!(resumed.as_deref(), Some("s-1"));

    let mut unrelated = BTreeMap::new();
    unrelated.insert("aps".to_string(), AnyValue::from("alert"));
    assert_eq!(
        engine.handle_push(unrelated).await.expect("Failed to handle push"),
        PushOutcome::Ignored
    );
    engine.shutdown().await;
}
