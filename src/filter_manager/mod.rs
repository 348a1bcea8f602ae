//! Registry and builder for the process tree.
//!
//! The manager owns the name → node map. The root is registered under
//! [`ROOT_FILTER_NAME`]; every other node is a [`FilterProcess`] wired to its
//! parent's byte stream by [`ProcessNode::add_child`].
//!
//! The registry is mutated only through `&mut self`, so concurrent
//! `create_filter` calls need external serialization by construction.

pub mod profile;


use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::node::{FilterProcess, NodeConfig, NodeError, ProcessNode};
use crate::pubsub::SubscribeError;

use self::profile::Profile;

/// Reserved registry name of the root node.
pub const ROOT_FILTER_NAME: &str = "Shell";

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("a filter named '{name}' already exists")]
    DuplicateFilter { name: String },

    #[error("no filter named '{name}'")]
    FilterNotFound { name: String },

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("profile error")]
    Profile(#[source] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Per-node deadline used by [`FilterManager::close`].
    pub close_timeout: Duration,
    /// Drain settings for every filter the manager creates.
    pub node: NodeConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(10),
            node: NodeConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct FilterManager {
    nodes: HashMap<String, Arc<dyn ProcessNode>>,
    /// Registration order, root first.
    order: Vec<String>,
    config: ManagerConfig,
    closed: bool,
}

impl FilterManager {
    /// Take ownership of a running root node.
    pub fn new(root: Arc<dyn ProcessNode>) -> Self {
        Self::with_config(root, ManagerConfig::default())
    }

    pub fn with_config(root: Arc<dyn ProcessNode>, config: ManagerConfig) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_FILTER_NAME.to_string(), root);
        Self {
            nodes,
            order: vec![ROOT_FILTER_NAME.to_string()],
            config,
            closed: false,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn root(&self) -> &Arc<dyn ProcessNode> {
        // The root entry is inserted at construction and never removed
        &self.nodes[ROOT_FILTER_NAME]
    }

    /// Spawn `command` as a new filter fed by the node registered as `parent`.
    ///
    /// The new node first receives the parent's history, then its live output.
    pub fn create_filter(
        &mut self,
        name: &str,
        command: &str,
        parent: &str,
    ) -> Result<Arc<dyn ProcessNode>, FilterError> {
        if self.nodes.contains_key(name) {
            return Err(FilterError::DuplicateFilter {
                name: name.to_string(),
            });
        }
        let parent_node = self.get_filter(parent)?.clone();

        let filter: Arc<dyn ProcessNode> =
            FilterProcess::spawn(name, command, self.config.node.clone())?;
        if let Err(e) = parent_node.add_child(filter.clone()) {
            if let Err(close_err) = filter.close(self.config.close_timeout) {
                warn!(node = name, error = %close_err, "Failed to close unwired filter");
            }
            return Err(e.into());
        }

        self.nodes.insert(name.to_string(), filter.clone());
        self.order.push(name.to_string());
        info!(node = name, command, parent, "Filter created");
        Ok(filter)
    }

    pub fn get_filter(&self, name: &str) -> Result<&Arc<dyn ProcessNode>, FilterError> {
        self.nodes
            .get(name)
            .ok_or_else(|| FilterError::FilterNotFound {
                name: name.to_string(),
            })
    }

    /// Every registered node in creation order, root first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ProcessNode>)> {
        self.order
            .iter()
            .filter_map(|name| self.nodes.get(name).map(|node| (name.as_str(), node)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Write the current tree shape to `path`.
    pub fn save_profile(&self, path: &Path) -> Result<(), FilterError> {
        let profile = Profile::from_manager(self);
        profile::save(path, &profile).map_err(FilterError::Profile)?;
        info!(path = %path.display(), nodes = self.len(), "Profile saved");
        Ok(())
    }

    /// Recreate the filters stored in `path` below the current root.
    ///
    /// The root entry of the file maps onto the existing root; its command is
    /// not re-run. All names are checked before any process is spawned, so a
    /// clash leaves the tree untouched.
    pub fn load_profile(&mut self, path: &Path) -> Result<(), FilterError> {
        let profile = profile::load(path).map_err(FilterError::Profile)?;
        if profile.command != self.root().command() {
            warn!(
                saved = %profile.command,
                running = self.root().command(),
                "Profile root command differs from the running root"
            );
        }

        let entries = profile.descendants();
        let mut seen: HashSet<&str> = HashSet::from([profile.name.as_str(), ROOT_FILTER_NAME]);
        for (_, entry) in &entries {
            if self.nodes.contains_key(&entry.name) || !seen.insert(entry.name.as_str()) {
                return Err(FilterError::DuplicateFilter {
                    name: entry.name.clone(),
                });
            }
        }

        for (parent, entry) in entries {
            let parent = if parent == profile.name {
                ROOT_FILTER_NAME
            } else {
                parent
            };
            self.create_filter(&entry.name, &entry.command, parent)?;
        }
        info!(path = %path.display(), nodes = self.len(), "Profile loaded");
        Ok(())
    }

    /// Close the whole tree through the root. Idempotent.
    pub fn close(&mut self) -> Result<(), FilterError> {
        self.closed = true;
        self.root().close(self.config.close_timeout)?;
        Ok(())
    }
}

impl Drop for FilterManager {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close process tree on drop");
            }
        }
    }
}
