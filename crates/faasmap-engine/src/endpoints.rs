//! Endpoint configuration.
//!
//! The remote pool consumes a JSON file describing the FaaS endpoints the
//! user has configured. Writing this file is the job of external
//! configuration tooling; the engine only reads it, and reads it
//! forgivingly: a missing or malformed file means "no endpoints known yet",
//! never a construction failure.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Default name of the endpoints file.
pub const DEFAULT_CONFIG_PATH: &str = "globus_config.json";

/// One configured endpoint.
///
/// Only `id` is consumed by the engine; `name` and `specs` are carried
/// verbatim for display and capacity-planning tooling.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointEntry {
    /// Endpoint identifier (a UUID with the upstream provider).
    pub id: String,
    /// Display name, if configured.
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form endpoint specifications.
    #[serde(default)]
    pub specs: Value,
}

/// The endpoints file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointsConfig {
    /// The configured endpoints.
    #[serde(default)]
    pub globus_compute_endpoints: Vec<EndpointEntry>,
}

impl EndpointsConfig {
    /// Loads the configuration from `path`.
    ///
    /// Absent, unreadable, or malformed files yield an empty configuration;
    /// malformed content is logged.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read endpoints file");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "malformed endpoints file");
                Self::default()
            }
        }
    }

    /// The configured endpoint ids, skipping entries with an empty id.
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.globus_compute_endpoints
            .iter()
            .filter(|entry| !entry.id.is_empty())
            .map(|entry| entry.id.clone())
            .collect()
    }
}
