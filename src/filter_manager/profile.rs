//! Disk persistence for filter tree profiles.
//!
//! A profile stores the shape of a tree (names, commands and parent/child
//! edges), never process state. The root entry is written first and children
//! nest inside their parent, so loading in document order always creates a
//! parent before its children.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use super::{FilterManager, ROOT_FILTER_NAME};
use crate::node::ProcessNode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub children: Vec<Profile>,
}

impl Profile {
    /// Snapshot the topology of a manager's tree.
    pub fn from_manager(manager: &FilterManager) -> Self {
        let root = manager.root();
        Self {
            name: ROOT_FILTER_NAME.to_string(),
            command: root.command().to_string(),
            children: root.children().iter().map(|c| Self::from_node(c.as_ref())).collect(),
        }
    }

    fn from_node(node: &dyn ProcessNode) -> Self {
        Self {
            name: node.name().to_string(),
            command: node.command().to_string(),
            children: node.children().iter().map(|c| Self::from_node(c.as_ref())).collect(),
        }
    }

    /// Every entry below this one, parents before children.
    pub fn descendants(&self) -> Vec<(&str, &Profile)> {
        let mut out = Vec::new();
        self.collect_descendants(&mut out);
        out
    }

    fn collect_descendants<'a>(&'a self, out: &mut Vec<(&'a str, &'a Profile)>) {
        for child in &self.children {
            out.push((self.name.as_str(), child));
            child.collect_descendants(out);
        }
    }
}

/// Default location of a named profile: `~/.proctree/profiles/<name>.json`.
pub fn default_profile_path(name: &str) -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".proctree")
        .join("profiles")
        .join(format!("{name}.json"))
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create profile directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to replace {} with {}",
            path.display(),
            tmp.display()
        )
    })?;
    Ok(())
}

pub fn load(path: &Path) -> anyhow::Result<Profile> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let profile: Profile =
        serde_json::from_str(&raw).with_context(|| format!("Invalid profile JSON at {}", path.display()))?;
    Ok(profile)
}

pub fn save(path: &Path, profile: &Profile) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(profile).context("Failed to serialize profile")?;
    write_atomic(path, &data)
}
