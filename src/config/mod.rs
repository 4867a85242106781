use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::store::DataStore;

/// Operator-level configuration persisted in `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub workspace_roots: Vec<PathBuf>,
}

pub struct ConfigManager {
    store: Arc<DataStore>,
    state: RwLock<FarmConfig>,
}

impl ConfigManager {
    pub async fn load(store: Arc<DataStore>) -> Result<Self> {
        let state = store.load_config().await?;
        Ok(Self {
            store,
            state: RwLock::new(state),
        })
    }

    pub fn workspace_roots(&self) -> Vec<PathBuf> {
        self.state.read().workspace_roots.clone()
    }

    pub async fn add_workspace_root(&self, path: PathBuf) -> bool {
        let added = {
            let mut state = self.state.write();
            if state.workspace_roots.contains(&path) {
                false
            } else {
                state.workspace_roots.push(path);
                true
            }
        };
        if added {
            self.persist().await;
        }
        added
    }

    pub async fn remove_workspace_root(&self, path: &PathBuf) -> bool {
        let removed = {
            let mut state = self.state.write();
            let before = state.workspace_roots.len();
            state.workspace_roots.retain(|p| p != path);
            state.workspace_roots.len() != before
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    async fn persist(&self) {
        let snapshot = self.state.read().clone();
        if let Err(e) = self.store.save_config(&snapshot).await {
            warn!(error = %e, "Failed to persist config");
        }
    }
}
