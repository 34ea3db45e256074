//! Instance identity.
//!
//! A stable UUID names this instance in the shared lock tables so listener
//! ownership survives restarts. Only the UUID is persisted, as a plain-text
//! `instance_id` file in the data dir; the display label is resolved fresh
//! on every run and published through the coordinator's instance heartbeat,
//! so relabeling an instance never rewrites local state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

/// Identity under which this process talks to the shared lock tables.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    /// Persistent UUID for this instance.
    pub instance_id: String,
    /// Display label for this run (not persisted).
    pub label: String,
}

/// Returns the path to the instance-id file in the XDG data directory.
pub fn instance_id_path() -> Result<PathBuf> {
    let data_dir = crate::config::dirs_data_path().context("could not determine data directory")?;
    Ok(data_dir.join("instance_id"))
}

/// Resolves this instance's identity, creating the id file on first use.
///
/// The label falls back to the hostname when none is given.
pub fn current(label: Option<&str>) -> Result<InstanceIdentity> {
    current_at(&instance_id_path()?, label)
}

pub(crate) fn current_at(path: &Path, label: Option<&str>) -> Result<InstanceIdentity> {
    let instance_id = match load_id(path)? {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            store_id(path, &id)?;
            id
        }
    };
    Ok(InstanceIdentity {
        instance_id,
        label: resolve_label(label),
    })
}

fn resolve_label(label: Option<&str>) -> String {
    match label {
        Some(label) => label.to_string(),
        None => hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn load_id(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let id = content.trim();
            Uuid::parse_str(id)
                .with_context(|| format!("corrupt instance-id file at {}", path.display()))?;
            Ok(Some(id.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("failed to read instance-id file"),
    }
}

fn store_id(path: &Path, id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create data directory")?;
    }
    std::fs::write(path, format!("{id}\n")).context("failed to write instance-id file")?;
    Ok(())
}
