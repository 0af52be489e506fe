//! Workspace registry
//!
//! A workspace is a named working directory plus an optional pre-command and
//! default terminal command. It is stored as
//! `<state-dir>/workspaces/<workspace-id>/meta.json`. Workspaces are never
//! deleted by this registry; that is left as explicit future work, matching
//! the source design.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub directory: PathBuf,
    #[serde(default)]
    pub pre_command: Option<String>,
    #[serde(default)]
    pub default_terminal_command: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceUpdate {
    pub name: Option<String>,
    pub directory: Option<PathBuf>,
    pub pre_command: Option<Option<String>>,
    pub default_terminal_command: Option<Option<String>>,
}

/// Registry rooted at `<state-dir>/workspaces/`.
#[derive(Debug, Clone)]
pub struct WorkspaceRegistry {
    root: PathBuf,
}

impl WorkspaceRegistry {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().join("workspaces"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The state directory this registry is rooted under (`root`'s parent).
    /// Used by the supervisor to pass `--state-dir` through to the detached
    /// `nohup` launcher, which needs its own registry handle.
    pub fn state_dir(&self) -> PathBuf {
        self.root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone())
    }

    pub fn workspace_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.workspace_dir(id).join(META_FILE)
    }

    /// Create a new workspace. The working directory is not required to
    /// exist yet; it only must exist by the time a process is launched in
    /// it.
    pub fn create(
        &self,
        name: &str,
        directory: PathBuf,
        pre_command: Option<String>,
        default_terminal_command: Option<String>,
    ) -> Result<Workspace> {
        let id = Uuid::new_v4().simple().to_string();
        let workspace = Workspace {
            id: id.clone(),
            name: name.to_string(),
            directory,
            pre_command,
            default_terminal_command,
        };

        let dir = self.workspace_dir(&id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating workspace directory {}", dir.display()))?;
        self.write(&workspace)?;
        Ok(workspace)
    }

    fn write(&self, workspace: &Workspace) -> Result<()> {
        let contents = serde_json::to_string_pretty(workspace).context("serializing workspace metadata")?;
        fs::write(self.meta_path(&workspace.id), contents).context("writing workspace metadata")
    }

    pub fn get(&self, id: &str) -> Result<Workspace> {
        let contents = fs::read_to_string(self.meta_path(id))
            .with_context(|| format!("reading metadata for workspace {}", id))?;
        serde_json::from_str(&contents).context("parsing workspace metadata")
    }

    pub fn list(&self) -> Result<Vec<Workspace>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut workspaces = Vec::new();
        for entry in fs::read_dir(&self.root).context("reading workspaces directory")? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if let Ok(workspace) = self.get(&id) {
                workspaces.push(workspace);
            }
        }
        workspaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workspaces)
    }

    pub fn update(&self, id: &str, update: WorkspaceUpdate) -> Result<Workspace> {
        let mut workspace = self.get(id)?;

        if let Some(name) = update.name {
            workspace.name = name;
        }
        if let Some(directory) = update.directory {
            workspace.directory = directory;
        }
        if let Some(pre_command) = update.pre_command {
            workspace.pre_command = pre_command;
        }
        if let Some(default_terminal_command) = update.default_terminal_command {
            workspace.default_terminal_command = default_terminal_command;
        }

        self.write(&workspace)?;
        Ok(workspace)
    }
}
