//! Run session records (`.xcbolt/sessions.json`)
//!
//! One record per launched app, keyed by bundle id and target, so `stop`
//! and `apps` can find what a previous `run` started.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::destination::{Destination, Kind, PlatformFamily, TargetType};

/// Current sessions document version.
pub const SESSIONS_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed sessions document at {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

/// One launched-app record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub bundle_id: String,
    pub pid: Option<i64>,
    pub target_kind: Kind,
    pub target_id: String,
    pub platform_family: PlatformFamily,
    pub target_type: TargetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion_bundle_id: Option<String>,
    /// RFC 3339 start time.
    pub started_at: String,
}

impl Session {
    /// Build a record for an app launched at the given destination.
    pub fn started(bundle_id: &str, pid: Option<i64>, destination: &Destination) -> Self {
        Self {
            id: session_id(bundle_id, &destination.target_id),
            bundle_id: bundle_id.to_string(),
            pid,
            target_kind: destination.kind,
            target_id: destination.target_id.clone(),
            platform_family: destination.platform_family,
            target_type: destination.target_type,
            companion_target: none_if_empty(&destination.companion_target),
            companion_bundle_id: none_if_empty(&destination.companion_bundle_id),
            started_at: Utc::now().to_rfc3339(),
        }
    }
}

fn none_if_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Stable session identifier.
pub fn session_id(bundle_id: &str, target_id: &str) -> String {
    if target_id.is_empty() {
        bundle_id.to_string()
    } else {
        format!("{bundle_id}@{target_id}")
    }
}

/// The persisted document: a version and a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStore {
    pub version: u32,
    pub sessions: Vec<Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            version: SESSIONS_VERSION,
            sessions: Vec::new(),
        }
    }

    pub fn path_in(root: &Path) -> PathBuf {
        root.join(".xcbolt").join("sessions.json")
    }

    /// Load from a project root. A missing document, an unreadable one, or a
    /// version mismatch all reset to an empty list (hard cutover).
    pub fn load(root: &Path) -> Self {
        let path = Self::path_in(root);
        let Ok(text) = fs::read_to_string(&path) else {
            return Self::new();
        };
        match serde_json::from_str::<SessionStore>(&text) {
            Ok(store) if store.version == SESSIONS_VERSION => store,
            _ => Self::new(),
        }
    }

    pub fn save(&self, root: &Path) -> Result<(), SessionError> {
        let path = Self::path_in(root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| SessionError::Write {
                path: path.clone(),
                source,
            })?;
        }
        let mut text =
            serde_json::to_string_pretty(self).map_err(|e| SessionError::Malformed {
                path: path.clone(),
                message: e.to_string(),
            })?;
        text.push('\n');
        fs::write(&path, text).map_err(|source| SessionError::Write { path, source })
    }

    /// Insert a session, replacing any existing record with the same id.
    pub fn upsert(&mut self, session: Session) {
        self.sessions.retain(|s| s.id != session.id);
        self.sessions.push(session);
    }

    /// Remove every session carrying the given bundle id; returns the
    /// removed records.
    pub fn remove_by_bundle(&mut self, bundle_id: &str) -> Vec<Session> {
        let (removed, kept) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|s| s.bundle_id == bundle_id);
        self.sessions = kept;
        removed
    }

    /// Find by exact session id, falling back to bundle id.
    pub fn find(&self, key: &str) -> Vec<&Session> {
        let by_id: Vec<&Session> = self.sessions.iter().filter(|s| s.id == key).collect();
        if !by_id.is_empty() {
            return by_id;
        }
        self.sessions.iter().filter(|s| s.bundle_id == key).collect()
    }
}
