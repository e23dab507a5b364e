//! Storage configuration and path management for tether.
//!
//! Every on-disk location the engine touches is derived here so tests can
//! point the whole engine at a temp directory with [`StorageConfig::with_root`].
//!
//! ```text
//! ~/.tether/
//!   config.json
//!   logs/
//!   projects/
//!     <sanitized project id>/
//!       metadata.json
//!       <sanitized session id>_messages.json
//!       archive/
//! ```

use std::path::{Path, PathBuf};

const HOME_ENV: &str = "TETHER_HOME";
const MAX_COMPONENT_LEN: usize = 120;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        if let Ok(root) = std::env::var(HOME_ENV) {
            if !root.trim().is_empty() {
                return Self {
                    root: PathBuf::from(root),
                };
            }
        }
        let root = dirs::home_dir()
            .map(|home| home.join(".tether"))
            .unwrap_or_else(|| std::env::temp_dir().join(".tether"));
        Self { root }
    }
}

impl StorageConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Global Files
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Per-Project Paths
    // ─────────────────────────────────────────────────────────────────────────────

    /// Example: `~/.tether/projects/-Users-pete-Code-app/`
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(sanitize_component(project_id))
    }

    pub fn metadata_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("metadata.json")
    }

    pub fn messages_file(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.project_dir(project_id)
            .join(format!("{}_messages.json", sanitize_component(session_id)))
    }

    pub fn archive_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("archive")
    }

    pub fn ensure_project_dir(&self, project_id: &str) -> std::io::Result<()> {
        fs_err::create_dir_all(self.project_dir(project_id))
    }
}

/// Maps an identifier onto a single safe path component.
///
/// Path separators, drive colons, control characters and shell-hostile
/// punctuation become `-`; leading dots are stripped so `..` can never climb
/// out of the projects directory. Empty results become `_`.
pub fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();

    while out.contains("..") {
        out = out.replace("..", "-");
    }
    let trimmed = out.trim_start_matches('.').trim();
    let mut out: String = trimmed.chars().take(MAX_COMPONENT_LEN).collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}
