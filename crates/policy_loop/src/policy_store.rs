use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::{Policy, PolicySource};

use crate::report_io::write_stable_json;

/// Reads and validates a policy file.
pub fn load_policy(path: &Path) -> Result<Policy> {
    let raw = fs::read_to_string(path).with_context(|| format!("read policy {}", path.display()))?;
    let policy: Policy =
        serde_json::from_str(&raw).with_context(|| format!("decode policy {}", path.display()))?;
    policy
        .validate()
        .with_context(|| format!("validate policy {}", path.display()))?;
    Ok(policy)
}

pub fn save_policy(path: &Path, policy: &Policy, precision: u32) -> Result<()> {
    policy.validate().context("refusing to save invalid policy")?;
    write_stable_json(path, policy, precision)
}

/// Current-policy accessor backed by a JSON file. A missing file means the
/// in-code default policy.
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicySource for FilePolicySource {
    fn current_policy(&self) -> Result<Policy> {
        match fs::metadata(&self.path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "policy file missing, using default policy");
                Ok(Policy::default_policy())
            }
            _ => load_policy(&self.path),
        }
    }
}
