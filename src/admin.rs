//! Administrative operations: identity CRUD and key rotation.
//!
//! Identities are only ever created and mutated through here (via the admin
//! CLI); the API path reads them but never writes.

use std::collections::HashSet;

use chrono::Utc;
use ipnet::IpNet;
use thiserror::Error;

use crate::auth::keyring::KeyRingError;
use crate::auth::{default_cidrs, KeyRing, RequestSigner};
use crate::model::{Identity, Role};
use crate::repo::{RepoError, Repository};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    KeyRing(#[from] KeyRingError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub scanned: usize,
    pub reencrypted: usize,
    pub failed: usize,
}

/// Create or replace an identity. An empty CIDR set means "deny all" and is
/// refused unless `explicit_deny_all` is set; omitting CIDRs entirely gets
/// the open default.
pub async fn put_identity(
    repo: &Repository,
    keyring: &KeyRing,
    client_id: &str,
    role: Role,
    hmac_key_b64: &str,
    cidrs: Vec<IpNet>,
    explicit_deny_all: bool,
) -> Result<(), AdminError> {
    if client_id.trim().is_empty() {
        return Err(AdminError::Invalid("client_id must not be empty".to_string()));
    }
    // The key must be usable for signing before it is stored.
    RequestSigner::from_base64_key(hmac_key_b64)
        .map_err(|e| AdminError::Invalid(e.to_string()))?;

    let allowed_cidrs = if cidrs.is_empty() {
        if explicit_deny_all {
            Vec::new()
        } else {
            default_cidrs()
        }
    } else {
        cidrs
    };

    let (stored, key_id) = keyring.encrypt_default(hmac_key_b64)?;
    repo.identity_put(Identity {
        client_id: client_id.to_string(),
        role,
        hmac_key_stored: stored,
        key_id,
        allowed_cidrs,
        created_at: Utc::now(),
    })
    .await?;
    Ok(())
}

pub async fn remove_identity(repo: &Repository, client_id: &str) -> Result<bool, AdminError> {
    Ok(repo.identity_delete(client_id).await?)
}

pub async fn list_identities(repo: &Repository) -> Result<Vec<Identity>, AdminError> {
    Ok(repo.identity_list().await?)
}

/// Re-encrypt stored HMAC keys in batches.
///
/// `target_key_id = Some(id)` re-encrypts everything not already under that
/// key; `None` decrypts to plaintext (removing ring protection). `limit`
/// bounds the total work, `batch_size` the per-query page.
pub async fn rotate_keys(
    repo: &Repository,
    keyring: &KeyRing,
    target_key_id: Option<&str>,
    limit: Option<usize>,
    batch_size: usize,
) -> Result<RotationReport, AdminError> {
    if let Some(target) = target_key_id {
        if !keyring.has_key(target) {
            return Err(AdminError::Invalid(format!(
                "target key {target:?} is not in the key ring"
            )));
        }
    }
    let batch_size = batch_size.max(1);

    let mut report = RotationReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let remaining = match limit {
            Some(limit) if report.scanned >= limit => break,
            Some(limit) => (limit - report.scanned).min(batch_size),
            None => batch_size,
        };

        let batch = repo
            .identities_not_using_key(target_key_id, remaining + seen.len())
            .await?;
        let fresh: Vec<String> = batch
            .into_iter()
            .filter(|id| !seen.contains(id))
            .take(remaining)
            .collect();
        if fresh.is_empty() {
            break;
        }

        for client_id in fresh {
            seen.insert(client_id.clone());
            report.scanned += 1;
            match reencrypt_one(repo, keyring, &client_id, target_key_id).await {
                Ok(()) => report.reencrypted += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(client_id = %client_id, error = %e, "re-encryption failed");
                }
            }
        }
    }
    Ok(report)
}

async fn reencrypt_one(
    repo: &Repository,
    keyring: &KeyRing,
    client_id: &str,
    target_key_id: Option<&str>,
) -> Result<(), AdminError> {
    let identity = repo
        .identity_get(client_id)
        .await?
        .ok_or_else(|| AdminError::Invalid(format!("identity {client_id:?} disappeared")))?;

    let plaintext = keyring.decrypt(&identity.hmac_key_stored, identity.key_id.as_deref())?;
    let (stored, key_id) = match target_key_id {
        Some(target) => (keyring.encrypt_with(target, &plaintext)?, Some(target.to_string())),
        None => (plaintext, None),
    };

    repo.identity_put(Identity {
        hmac_key_stored: stored,
        key_id,
        ..identity
    })
    .await?;
    Ok(())
}
