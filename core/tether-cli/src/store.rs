//! Offline storage commands. These never open a connection.

use serde_json::json;
use tether_core::{PersistenceStore, ProjectDescriptor, Result, StorageConfig};

use crate::output::print_json;

pub fn history(storage: StorageConfig, project_path: &str, session: Option<String>) -> Result<()> {
    let store = PersistenceStore::new(storage);
    let project = ProjectDescriptor::from_path(project_path);
    let session = session.or_else(|| {
        store
            .get_metadata(&project.id)
            .and_then(|record| record.remote_session_id)
    });

    let Some(session) = session else {
        tracing::info!(project_id = %project.id, "No session recorded for project");
        return print_json(&json!({ "projectId": project.id, "messages": [] }));
    };

    let messages = store.load(&project.id, &session);
    print_json(&json!({
        "projectId": project.id,
        "sessionId": session,
        "messages": messages,
    }))
}

pub fn metadata(storage: StorageConfig, project_path: &str) -> Result<()> {
    let store = PersistenceStore::new(storage);
    let project = ProjectDescriptor::from_path(project_path);
    print_json(&store.get_metadata(&project.id))
}

pub fn clear(storage: StorageConfig, project_path: &str) -> Result<()> {
    let store = PersistenceStore::new(storage);
    let project = ProjectDescriptor::from_path(project_path);
    store.clear(&project.id)?;
    tracing::info!(project_id = %project.id, "Cleared project storage");
    print_json(&json!({ "projectId": project.id, "cleared": true }))
}

pub fn archive(storage: StorageConfig, project_path: &str) -> Result<()> {
    let store = PersistenceStore::new(storage);
    let project = ProjectDescriptor::from_path(project_path);
    let archived = store.archive(&project.id)?;
    print_json(&json!({ "projectId": project.id, "archived": archived }))
}
