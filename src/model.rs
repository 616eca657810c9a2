//! Records persisted in the ledger and returned to callers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A provisionable challenge image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Image id passed to the runtime.
    pub template_id: String,
    /// Human-readable image tag, e.g. `web_01:latest`.
    pub tag: String,
    pub challenge_id: i64,
    pub challenge_name: String,
    /// Time an instance may run before the reaper stops it.
    pub lifetime_seconds: u64,
}

/// One workload spawned from a template on behalf of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub instance_id: String,
    pub template_id: String,
    pub port: u16,
    pub start_time: DateTime<Utc>,
    /// Session id of the requester.
    pub owner: String,
    pub terminated: bool,
}

/// A non-terminated instance joined with the lifetime of its template.
#[derive(Debug, Clone)]
pub struct LiveInstance {
    pub instance: Instance,
    pub lifetime_seconds: Option<u64>,
}

impl LiveInstance {
    /// Whether the instance has used up `lifetime` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, default_lifetime: u64) -> bool {
        let lifetime = self.lifetime_seconds.unwrap_or(default_lifetime);
        now - self.instance.start_time >= seconds(lifetime)
    }
}

/// Audit record in the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Where a caller can reach its instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Access {
    pub host: String,
    pub port: u16,
    pub url: String,
}

impl Access {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            url: format!("http://{}:{}", host, port),
        }
    }
}

pub(crate) fn seconds(secs: u64) -> Duration {
    // chrono panics on out-of-range seconds.
    Duration::seconds(secs.min(u32::MAX as u64) as i64)
}
