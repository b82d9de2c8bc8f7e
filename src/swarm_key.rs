//! Named pre-shared swarm keys.
//!
//! The registry is a flat JSON list kept outside the node repository. The
//! key that is actually in force is the `swarm.key` file inside the
//! repository; its presence alone decides private vs public mode.

use crate::error::{BridgeError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

pub const SWARM_KEY_FILE: &str = "swarm.key";

const KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
const KEY_ENCODING: &str = "/base16/";
const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmKeyEntry {
    pub name: String,
    pub key: String,
}

/// Whether the repository is in private mode, and under which saved name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwarmKeyStatus {
    pub active: bool,
    pub name: Option<String>,
}

/// Produce fresh key material. Nothing is persisted.
pub fn generate() -> String {
    let mut secret = [0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut secret);
    format!("{}\n{}\n{}\n", KEY_HEADER, KEY_ENCODING, hex::encode(secret))
}

/// Check the three-line `psk/1.0.0` + `base16` + 64 hex digit layout.
pub fn validate_swarm_key(key: &str) -> Result<()> {
    let mut lines = key.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some(KEY_HEADER) {
        return Err(BridgeError::SwarmKeyError(format!(
            "key must start with {}",
            KEY_HEADER
        )));
    }
    if lines.next() != Some(KEY_ENCODING) {
        return Err(BridgeError::SwarmKeyError(format!(
            "only {} keys are supported",
            KEY_ENCODING
        )));
    }
    let secret = lines
        .next()
        .ok_or_else(|| BridgeError::SwarmKeyError("missing key secret".into()))?;
    match hex::decode(secret) {
        Ok(bytes) if bytes.len() == SECRET_LEN => {}
        _ => {
            return Err(BridgeError::SwarmKeyError(format!(
                "secret must be {} hex digits",
                SECRET_LEN * 2
            )))
        }
    }
    if lines.next().is_some() {
        return Err(BridgeError::SwarmKeyError("unexpected trailing data".into()));
    }
    Ok(())
}

/// Persisted list of named keys.
#[derive(Debug, Clone)]
pub struct SwarmKeyRegistry {
    path: PathBuf,
}

impl SwarmKeyRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Result<Vec<SwarmKeyEntry>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<SwarmKeyEntry>> {
        Ok(self.list().await?.into_iter().find(|e| e.name == name))
    }

    /// Insert or replace the entry called `name`.
    pub async fn save(&self, name: &str, key: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BridgeError::SwarmKeyError("key name must not be empty".into()));
        }
        validate_swarm_key(key)?;

        let mut entries = self.list().await?;
        let entry = SwarmKeyEntry {
            name: name.to_string(),
            key: key.to_string(),
        };
        match entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.write(&entries).await?;
        info!(name, "Swarm key saved");
        Ok(())
    }

    /// Remove `name`. Returns whether an entry was removed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut entries = self.list().await?;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        if entries.len() == before {
            return Ok(false);
        }
        self.write(&entries).await?;
        info!(name, "Swarm key deleted");
        Ok(true)
    }

    async fn write(&self, entries: &[SwarmKeyEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Read the repository key (if any) and name it from the registry.
    /// Contents are compared exactly except for leading and trailing
    /// whitespace, so a saved key without its final newline still matches.
    pub async fn status(&self, repo_path: &Path) -> Result<SwarmKeyStatus> {
        let Some(installed) = read_installed_key(repo_path).await? else {
            return Ok(SwarmKeyStatus {
                active: false,
                name: None,
            });
        };
        let name = self
            .list()
            .await?
            .into_iter()
            .find(|e| e.key.trim() == installed.trim())
            .map(|e| e.name);
        Ok(SwarmKeyStatus { active: true, name })
    }
}

pub async fn read_installed_key(repo_path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(repo_path.join(SWARM_KEY_FILE)).await {
        Ok(key) => Ok(Some(key)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `key` as the repository's swarm key.
pub async fn install_key(repo_path: &Path, key: &str) -> Result<()> {
    validate_swarm_key(key)?;
    fs::create_dir_all(repo_path).await?;
    fs::write(repo_path.join(SWARM_KEY_FILE), key).await?;
    Ok(())
}

/// Delete the repository's swarm key. Missing file is not an error.
pub async fn remove_key(repo_path: &Path) -> Result<()> {
    match fs::remove_file(repo_path.join(SWARM_KEY_FILE)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
