//! Request authentication: HMAC verification, replay window, CIDR
//! filtering, and role checks.

pub mod keyring;
pub mod signer;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;

use crate::error::ApiError;
use crate::model::Role;
use crate::repo::Repository;

pub use keyring::KeyRing;
pub use signer::RequestSigner;

/// The three headers carried by every authenticated request.
pub const HEADER_CLIENT_ID: &str = "x-dffmpeg-client-id";
pub const HEADER_TIMESTAMP: &str = "x-dffmpeg-timestamp";
pub const HEADER_SIGNATURE: &str = "x-dffmpeg-signature";

/// A verified peer, attached to the request for handlers to authorize on.
#[derive(Debug, Clone)]
pub struct AuthedPeer {
    pub client_id: String,
    pub role: Role,
    pub source_ip: IpAddr,
}

impl AuthedPeer {
    pub fn require_role(&self, role: Role) -> Result<(), ApiError> {
        if self.role == role || self.role == Role::Admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "requires {} role",
                role.as_str()
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub struct RequestVerifier {
    repo: Repository,
    keyring: KeyRing,
    skew_s: u32,
    trusted_proxies: Vec<IpNet>,
}

impl RequestVerifier {
    pub fn new(
        repo: Repository,
        keyring: KeyRing,
        skew_s: u32,
        trusted_proxies: Vec<IpNet>,
    ) -> Self {
        Self {
            repo,
            keyring,
            skew_s,
            trusted_proxies,
        }
    }

    /// Verify one inbound request. Every rejection maps to 401; the precise
    /// reason only reaches the logs, never the peer.
    #[allow(clippy::too_many_arguments)]
    pub async fn verify(
        &self,
        method: &str,
        path_and_query: &str,
        client_id: Option<&str>,
        timestamp: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
        peer_addr: IpAddr,
        forwarded_for: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AuthedPeer, ApiError> {
        let source_ip = self.resolve_source_ip(peer_addr, forwarded_for);

        let (client_id, timestamp, signature) = match (client_id, timestamp, signature) {
            (Some(c), Some(t), Some(s)) => (c, t, s),
            _ => {
                tracing::warn!(source_ip = %source_ip, "request with missing auth headers");
                return Err(ApiError::AuthRejected(
                    "missing authentication headers".to_string(),
                ));
            }
        };

        let timestamp: i64 = timestamp.parse().map_err(|_| {
            tracing::warn!(client_id, source_ip = %source_ip, "malformed timestamp header");
            ApiError::AuthRejected("invalid credentials".to_string())
        })?;

        let identity = self
            .repo
            .identity_get(client_id)
            .await?
            .ok_or_else(|| {
                tracing::warn!(client_id, source_ip = %source_ip, "unknown identity");
                ApiError::AuthRejected("invalid credentials".to_string())
            })?;

        if !cidrs_contain(&identity.allowed_cidrs, source_ip) {
            tracing::warn!(client_id, source_ip = %source_ip, "source address outside allowed CIDRs");
            return Err(ApiError::AuthRejected("invalid credentials".to_string()));
        }

        let hmac_key = self
            .keyring
            .decrypt(&identity.hmac_key_stored, identity.key_id.as_deref())
            .map_err(|e| {
                tracing::error!(client_id, error = %e, "failed to decrypt stored HMAC key");
                ApiError::Internal("credential store failure".to_string())
            })?;
        let signer = RequestSigner::from_base64_key(&hmac_key).map_err(|e| {
            tracing::error!(client_id, error = %e, "stored HMAC key is not valid base64");
            ApiError::Internal("credential store failure".to_string())
        })?;

        if !signer.verify(
            method,
            path_and_query,
            timestamp,
            signature,
            body,
            now.timestamp(),
            self.skew_s,
        ) {
            tracing::warn!(client_id, source_ip = %source_ip, path = path_and_query,
                "signature verification failed");
            return Err(ApiError::AuthRejected("invalid credentials".to_string()));
        }

        tracing::debug!(client_id, role = identity.role.as_str(), path = path_and_query,
            "request authenticated");
        Ok(AuthedPeer {
            client_id: identity.client_id,
            role: identity.role,
            source_ip,
        })
    }

    /// The effective source address. X-Forwarded-For is only honored when
    /// the connecting peer is a trusted proxy; then the leftmost entry that
    /// is not itself a trusted proxy wins.
    fn resolve_source_ip(&self, peer_addr: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !cidrs_contain(&self.trusted_proxies, peer_addr) {
            return peer_addr;
        }
        let Some(header) = forwarded_for else {
            return peer_addr;
        };
        for entry in header.split(',') {
            if let Ok(ip) = entry.trim().parse::<IpAddr>() {
                if !cidrs_contain(&self.trusted_proxies, ip) {
                    return ip;
                }
            }
        }
        peer_addr
    }
}

pub fn cidrs_contain(cidrs: &[IpNet], ip: IpAddr) -> bool {
    cidrs.iter().any(|net| net.contains(&ip))
}

/// The open-by-default CIDR set: accept from anywhere.
pub fn default_cidrs() -> Vec<IpNet> {
    vec![
        "0.0.0.0/0".parse().expect("valid IPv4 catch-all"),
        "::/0".parse().expect("valid IPv6 catch-all"),
    ]
}
