//! Emergency kill switch blocking new entries.
//!
//! Three layers are checked: an in-process global flag, per-user flags and
//! an optional sentinel file so an operator can halt a running bot from a
//! separate `cryptotrader halt` invocation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::{error, info};

#[derive(Debug, Default)]
pub struct KillSwitch {
    global: AtomicBool,
    users: DashMap<String, String>,
    sentinel: Option<PathBuf>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill switch that also honours a sentinel file at `path`.
    pub fn with_sentinel(path: impl Into<PathBuf>) -> Self {
        Self {
            sentinel: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn sentinel(&self) -> Option<&Path> {
        self.sentinel.as_deref()
    }

    /// Reason trading is blocked for `user_id`, if any.
    pub fn check(&self, user_id: &str) -> Option<String> {
        if self.global.load(Ordering::SeqCst) {
            return Some("global kill switch engaged".to_string());
        }

        if let Some(path) = &self.sentinel {
            if path.exists() {
                let note = std::fs::read_to_string(path).unwrap_or_default();
                let note = note.trim();
                return Some(if note.is_empty() {
                    format!("kill file present at {}", path.display())
                } else {
                    format!("kill file present: {}", note)
                });
            }
        }

        self.users
            .get(user_id)
            .map(|reason| format!("user kill switch: {}", reason.value()))
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.check(user_id).is_some()
    }

    pub fn engage_global(&self, reason: &str) {
        self.global.store(true, Ordering::SeqCst);
        error!(reason = %reason, "Global kill switch ENGAGED");
    }

    pub fn release_global(&self) {
        self.global.store(false, Ordering::SeqCst);
        info!("Global kill switch released");
    }

    pub fn engage_user(&self, user_id: &str, reason: &str) {
        self.users.insert(user_id.to_string(), reason.to_string());
        error!(user_id = %user_id, reason = %reason, "User kill switch ENGAGED");
    }

    pub fn release_user(&self, user_id: &str) {
        if self.users.remove(user_id).is_some() {
            info!(user_id = %user_id, "User kill switch released");
        }
    }

    /// Create the sentinel file with an operator note.
    pub fn write_sentinel(&self, note: &str) -> Result<()> {
        let Some(path) = &self.sentinel else {
            anyhow::bail!("No kill file configured");
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, note)
            .with_context(|| format!("Failed to write kill file {}", path.display()))?;
        error!(path = %path.display(), "Kill file written, new entries blocked");
        Ok(())
    }

    /// Remove the sentinel file. Returns whether one existed.
    pub fn clear_sentinel(&self) -> Result<bool> {
        let Some(path) = &self.sentinel else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove kill file {}", path.display()))?;
        info!(path = %path.display(), "Kill file removed");
        Ok(true)
    }
}
