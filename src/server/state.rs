use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::Catalog;
use crate::jobs::JobLauncher;
use crate::storage::StorageSync;

use super::ServerConfig;

pub type GuardedJobLauncher = Arc<JobLauncher>;
pub type GuardedStorageSync = Arc<StorageSync>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub launcher: GuardedJobLauncher,
    pub catalog: Catalog,
    pub sync: GuardedStorageSync,
}

impl FromRef<ServerState> for GuardedJobLauncher {
    fn from_ref(input: &ServerState) -> Self {
        input.launcher.clone()
    }
}

impl FromRef<ServerState> for Catalog {
    fn from_ref(input: &ServerState) -> Self {
        input.catalog.clone()
    }
}

impl FromRef<ServerState> for GuardedStorageSync {
    fn from_ref(input: &ServerState) -> Self {
        input.sync.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
