//! Control-plane request and response documents.
//!
//! The transport layer is provided by the embedding node; this module only
//! fixes the routes and the JSON shapes it exchanges with the controller.
//!
//! | Operation | Method | Path |
//! |-----------|--------|------|
//! | start | PUT | `/_plugins/_replication/{index}/_start` |
//! | stop | POST | `/_plugins/_replication/{index}/_stop` |
//! | pause | POST | `/_plugins/_replication/{index}/_pause` |
//! | resume | POST | `/_plugins/_replication/{index}/_resume` |
//! | update | PUT | `/_plugins/_replication/{index}/_update` |
//! | status | GET | `/_plugins/_replication/{index}/_status` |
//! | leader stats | GET | `/_plugins/_replication/leader_stats` |
//! | follower stats | GET | `/_plugins/_replication/follower_stats` |
//! | auto-follow upsert | POST | `/_plugins/_replication/_autofollow` |
//! | auto-follow delete | DELETE | `/_plugins/_replication/_autofollow` |

use crate::settings::IndexSettings;
use serde::{Deserialize, Serialize};

pub const BASE_PATH: &str = "/_plugins/_replication";

/// A control-plane route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub method: &'static str,
    /// Path template; `{index}` is the follower index name.
    pub path: &'static str,
}

impl Route {
    pub const fn new(method: &'static str, path: &'static str) -> Self {
        Self { method, path }
    }

    /// Substitute the follower index into the path template.
    pub fn path_for(&self, index: &str) -> String {
        self.path.replace("{index}", index)
    }
}

pub const START: Route = Route::new("PUT", "/_plugins/_replication/{index}/_start");
pub const STOP: Route = Route::new("POST", "/_plugins/_replication/{index}/_stop");
pub const PAUSE: Route = Route::new("POST", "/_plugins/_replication/{index}/_pause");
pub const RESUME: Route = Route::new("POST", "/_plugins/_replication/{index}/_resume");
pub const UPDATE: Route = Route::new("PUT", "/_plugins/_replication/{index}/_update");
pub const STATUS: Route = Route::new("GET", "/_plugins/_replication/{index}/_status");
pub const LEADER_STATS: Route = Route::new("GET", "/_plugins/_replication/leader_stats");
pub const FOLLOWER_STATS: Route = Route::new("GET", "/_plugins/_replication/follower_stats");
pub const AUTOFOLLOW_UPSERT: Route = Route::new("POST", "/_plugins/_replication/_autofollow");
pub const AUTOFOLLOW_DELETE: Route = Route::new("DELETE", "/_plugins/_replication/_autofollow");

/// Security roles assumed on each side of the relationship. Passed through
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseRoles {
    pub leader_cluster_role: String,
    pub follower_cluster_role: String,
}

/// Body of `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReplicationRequest {
    pub leader_alias: String,
    pub leader_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_roles: Option<UseRoles>,
    #[serde(default, skip_serializing_if = "IndexSettings::is_empty")]
    pub settings: IndexSettings,
}

impl StartReplicationRequest {
    pub fn new(leader_alias: impl Into<String>, leader_index: impl Into<String>) -> Self {
        Self {
            leader_alias: leader_alias.into(),
            leader_index: leader_index.into(),
            use_roles: None,
            settings: IndexSettings::default(),
        }
    }

    pub fn with_roles(mut self, leader_cluster_role: &str, follower_cluster_role: &str) -> Self {
        self.use_roles = Some(UseRoles {
            leader_cluster_role: leader_cluster_role.to_string(),
            follower_cluster_role: follower_cluster_role.to_string(),
        });
        self
    }

    pub fn with_settings(mut self, settings: IndexSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Query parameters of `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub wait_for_restore: bool,
}

/// Body of `pause`; an empty body pauses with "User initiated".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseReplicationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Query parameters of `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub verbose: bool,
}

/// Body of the auto-follow upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoFollowRequest {
    pub leader_alias: String,
    pub name: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_roles: Option<UseRoles>,
    #[serde(default, skip_serializing_if = "IndexSettings::is_empty")]
    pub settings: IndexSettings,
}

/// Body of the auto-follow delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAutoFollowRequest {
    pub leader_alias: String,
    pub name: String,
}

/// Response of every mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgedResponse {
    pub acknowledged: bool,
}

impl AcknowledgedResponse {
    pub const ACK: AcknowledgedResponse = AcknowledgedResponse { acknowledged: true };

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }
}
