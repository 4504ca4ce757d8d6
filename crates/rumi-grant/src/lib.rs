// SPDX-License-Identifier: MIT OR Apache-2.0
//! rumi-grant
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! HMAC-signed [`NetworkGrant`]s and the capability [`TrustStore`] /
//! [`GrantStore`] persistence layers (§4.5, §4.6). Verification failure of a
//! grant's signature is always treated as an absent grant — callers never
//! see a distinction between "no grant" and "tampered grant".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rumi_core::{CapabilityGrant, NetworkGrant, TrustEntry};
use rumi_error::{ErrorKind, RumiError};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Errors from grant signing, persistence, or trust operations.
#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    /// The supplied HMAC key was empty or otherwise rejected by the MAC
    /// implementation.
    #[error("invalid HMAC key")]
    InvalidKey,
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<GrantError> for RumiError {
    fn from(err: GrantError) -> Self {
        RumiError::new(ErrorKind::GrantMissing, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// HMAC key management
// ---------------------------------------------------------------------------

/// Load the HMAC signing key from `path`, generating and persisting a fresh
/// 32-byte key (file mode `0600` on Unix) if none exists yet.
pub fn load_or_create_hmac_key(path: &Path) -> Result<Vec<u8>, GrantError> {
    if path.is_file() {
        return Ok(std::fs::read(path)?);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut key = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    std::fs::write(path, &key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// NetworkGrant signing
// ---------------------------------------------------------------------------

/// Canonical bytes of a [`NetworkGrant`] with `hmac_signature` cleared,
/// matching the convention this workspace already uses for canonicalizing
/// structs before hashing/signing them.
fn canonical_bytes(grant: &NetworkGrant) -> Result<Vec<u8>, GrantError> {
    let mut value = serde_json::to_value(grant)?;
    if let serde_json::Value::Object(ref mut map) = value {
        map.insert("hmac_signature".to_string(), serde_json::Value::Null);
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Compute the hex-encoded HMAC-SHA256 signature for `grant` under `key`.
pub fn sign_network_grant(key: &[u8], grant: &NetworkGrant) -> Result<String, GrantError> {
    let bytes = canonical_bytes(grant)?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| GrantError::InvalidKey)?;
    mac.update(&bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify that `grant.hmac_signature` matches the recomputed signature under
/// `key`. Any failure (malformed hex, wrong key, tampered fields) returns
/// `false` — callers must treat this identically to "no grant exists".
pub fn verify_network_grant(key: &[u8], grant: &NetworkGrant) -> bool {
    let Ok(bytes) = canonical_bytes(grant) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(&bytes);
    let Ok(stored) = hex::decode(&grant.hmac_signature) else {
        return false;
    };
    mac.verify_slice(&stored).is_ok()
}

// ---------------------------------------------------------------------------
// GrantStore
// ---------------------------------------------------------------------------

/// Filesystem-backed store of [`NetworkGrant`]s and [`CapabilityGrant`]s.
pub struct GrantStore {
    user_data_root: PathBuf,
    hmac_key: Vec<u8>,
}

impl GrantStore {
    /// Open a store rooted at `user_data_root`, loading (or minting) its
    /// HMAC signing key from `permissions/.secret_key`.
    pub fn open(user_data_root: impl Into<PathBuf>) -> Result<Self, GrantError> {
        let user_data_root = user_data_root.into();
        let key_path = user_data_root.join("permissions/.secret_key");
        let hmac_key = load_or_create_hmac_key(&key_path)?;
        Ok(Self { user_data_root, hmac_key })
    }

    fn network_grant_path(&self, pack_id: &str) -> PathBuf {
        self.user_data_root.join("permissions/network").join(format!("{pack_id}.json"))
    }

    fn capability_grants_path(&self, principal_id: &str) -> PathBuf {
        self.user_data_root
            .join("permissions/capabilities")
            .join(format!("{principal_id}.json"))
    }

    /// Issue (or replace) a [`NetworkGrant`] for `pack_id`, signing it with
    /// this store's HMAC key and persisting it.
    pub fn issue_network_grant(
        &self,
        pack_id: &str,
        allowed_domains: Vec<String>,
        allowed_ports: Vec<u16>,
        granted_by: &str,
    ) -> Result<NetworkGrant, GrantError> {
        let mut grant = NetworkGrant {
            pack_id: pack_id.to_string(),
            enabled: true,
            allowed_domains,
            allowed_ports,
            granted_at: Utc::now(),
            granted_by: granted_by.to_string(),
            hmac_signature: String::new(),
        };
        grant.hmac_signature = sign_network_grant(&self.hmac_key, &grant)?;

        let dir = self.user_data_root.join("permissions/network");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(self.network_grant_path(pack_id), serde_json::to_string_pretty(&grant)?)?;

        tracing::info!(pack_id = %pack_id, "network grant issued");
        Ok(grant)
    }

    /// Load and verify the [`NetworkGrant`] for `pack_id`.
    ///
    /// Returns `None` if no grant file exists, the grant is `enabled: false`,
    /// or its signature fails to verify — all three are equivalent to the
    /// caller ("treat as absent grant", §4.5).
    pub fn load_network_grant(&self, pack_id: &str) -> Option<NetworkGrant> {
        let path = self.network_grant_path(pack_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        let grant: NetworkGrant = serde_json::from_str(&raw).ok()?;
        if !grant.enabled {
            return None;
        }
        if !verify_network_grant(&self.hmac_key, &grant) {
            tracing::warn!(pack_id = %pack_id, "network grant signature verification failed");
            return None;
        }
        Some(grant)
    }

    /// Disable (without deleting) every [`NetworkGrant`] referencing
    /// `pack_id`. Called when manifest verification detects drift and
    /// demotes the Pack away from `approved`.
    pub fn invalidate_network_grant(&self, pack_id: &str) -> Result<(), GrantError> {
        let path = self.network_grant_path(pack_id);
        if !path.is_file() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut grant: NetworkGrant = serde_json::from_str(&raw)?;
        grant.enabled = false;
        grant.hmac_signature = sign_network_grant(&self.hmac_key, &grant)?;
        std::fs::write(&path, serde_json::to_string_pretty(&grant)?)?;
        tracing::warn!(pack_id = %pack_id, "network grant invalidated");
        Ok(())
    }

    /// Grant `permission_id` to `principal_id`. Idempotent: granting the
    /// same pair twice leaves a single entry.
    pub fn grant_capability(
        &self,
        principal_id: &str,
        permission_id: &str,
        granted_by: &str,
    ) -> Result<(), GrantError> {
        let mut grants = self.list_capability_grants(principal_id)?;
        if grants.iter().any(|g| g.permission_id == permission_id) {
            return Ok(());
        }
        grants.push(CapabilityGrant {
            principal_id: principal_id.to_string(),
            permission_id: permission_id.to_string(),
            granted_at: Utc::now(),
            granted_by: granted_by.to_string(),
        });
        let dir = self.user_data_root.join("permissions/capabilities");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            self.capability_grants_path(principal_id),
            serde_json::to_string_pretty(&grants)?,
        )?;
        tracing::info!(principal_id = %principal_id, permission_id = %permission_id, "capability grant issued");
        Ok(())
    }

    /// All capability grants held by `principal_id`.
    pub fn list_capability_grants(&self, principal_id: &str) -> Result<Vec<CapabilityGrant>, GrantError> {
        let path = self.capability_grants_path(principal_id);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Returns `true` if `principal_id` currently holds a grant for
    /// `permission_id`.
    pub fn has_capability_grant(&self, principal_id: &str, permission_id: &str) -> bool {
        self.list_capability_grants(principal_id)
            .map(|grants| grants.iter().any(|g| g.permission_id == permission_id))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// TrustStore
// ---------------------------------------------------------------------------

/// Filesystem-backed `handler_id -> {sha256}` allowlist
/// (`capabilities/trust/trusted_handlers.json`).
pub struct TrustStore {
    path: PathBuf,
    entries: BTreeMap<String, TrustEntry>,
}

impl TrustStore {
    /// Load the trust store rooted at `user_data_root`.
    pub fn load(user_data_root: impl AsRef<Path>) -> Result<Self, GrantError> {
        let path = user_data_root
            .as_ref()
            .join("capabilities/trust/trusted_handlers.json");
        let entries = if path.is_file() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    fn persist(&self) -> Result<(), GrantError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }

    /// Add `sha256` as a trusted hash for `handler_id`.
    pub fn trust(&mut self, handler_id: &str, sha256: &str) -> Result<(), GrantError> {
        let entry = self
            .entries
            .entry(handler_id.to_string())
            .or_insert_with(|| TrustEntry {
                handler_id: handler_id.to_string(),
                trusted_sha256: Vec::new(),
            });
        if !entry.trusted_sha256.iter().any(|h| h == sha256) {
            entry.trusted_sha256.push(sha256.to_string());
        }
        self.persist()
    }

    /// Returns `true` if `(handler_id, sha256)` is a trusted pair.
    pub fn is_trusted(&self, handler_id: &str, sha256: &str) -> bool {
        self.entries.get(handler_id).is_some_and(|e| e.trusts(sha256))
    }

    /// Look up the trust entry for `handler_id`, if any.
    pub fn get(&self, handler_id: &str) -> Option<&TrustEntry> {
        self.entries.get(handler_id)
    }
}
