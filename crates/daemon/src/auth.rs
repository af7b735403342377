//! Identity and bearer tokens.
//!
//! Users are declared in the configuration file with a SHA-256 password
//! digest. [`TokenAuthority`] checks their passwords, issues signed tokens and
//! verifies tokens presented on the WebSocket `auth` message or as an HTTP
//! `Authorization: Bearer` header.
//!
//! A token is `base64url(claims).base64url(HMAC-SHA256(secret, claims))`,
//! where the claims are JSON `{sub, username, role, exp}`.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use protocol::UserInfo;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::{AuthConfig, UserConfig};

type HmacSha256 = Hmac<Sha256>;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The token is malformed, forged, expired, or names an unknown user.
    #[error("Invalid token")]
    InvalidToken,

    /// Username or password is wrong.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// A configured user entry is unusable.
    #[error("Invalid user entry for {username}: {reason}")]
    InvalidUser { username: String, reason: String },

    /// Internal error
    #[error("Internal auth error: {0}")]
    Internal(String),
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub role: String,
}

impl From<&Identity> for UserInfo {
    fn from(identity: &Identity) -> Self {
        UserInfo {
            id: identity.id.clone(),
            username: identity.username.clone(),
            role: identity.role.clone(),
        }
    }
}

/// Resolves bearer tokens to identities.
pub trait TokenVerifier: Send + Sync {
    fn verify_token(&self, token: &str) -> Result<Identity, AuthError>;
}

/// A freshly issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub user: UserInfo,
    /// Unix seconds.
    pub expires_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    role: String,
    exp: u64,
}

struct StoredUser {
    identity: Identity,
    password_sha256: [u8; 32],
}

/// Issues and verifies tokens for the configured users.
pub struct TokenAuthority {
    secret: Vec<u8>,
    ttl: Duration,
    users: HashMap<String, StoredUser>,
}

impl TokenAuthority {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        ttl: Duration,
        users: &[UserConfig],
    ) -> Result<Self, AuthError> {
        let mut stored = HashMap::with_capacity(users.len());
        for user in users {
            let digest = hex::decode(user.password_sha256.trim()).map_err(|e| {
                AuthError::InvalidUser {
                    username: user.username.clone(),
                    reason: e.to_string(),
                }
            })?;
            let password_sha256: [u8; 32] =
                digest.try_into().map_err(|_| AuthError::InvalidUser {
                    username: user.username.clone(),
                    reason: "password_sha256 must be 32 bytes".to_string(),
                })?;

            stored.insert(
                user.username.clone(),
                StoredUser {
                    identity: Identity {
                        id: user_id_for(&user.username),
                        username: user.username.clone(),
                        role: user.role.clone(),
                    },
                    password_sha256,
                },
            );
        }

        Ok(Self {
            secret: secret.into(),
            ttl,
            users: stored,
        })
    }

    /// Builds the authority from the `[auth]` section.
    ///
    /// Without a configured secret a random one is generated, so tokens do
    /// not survive a restart.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let secret = match config.secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!("No auth secret configured, generating an ephemeral one");
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        let authority = Self::new(
            secret,
            Duration::from_secs(config.token_ttl_secs),
            &config.users,
        )?;
        if authority.users.is_empty() {
            tracing::warn!("No users configured, every login will be rejected");
        }
        Ok(authority)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Checks a password and issues a token.
    pub fn login(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let candidate = Sha256::digest(password.as_bytes());
        let user = self.users.get(username);

        let matches = match user {
            Some(user) => bool::from(
                user.password_sha256
                    .as_slice()
                    .ct_eq(candidate.as_slice()),
            ),
            None => false,
        };

        match user {
            Some(user) if matches => {
                tracing::info!(username = %username, "Login succeeded");
                self.issue_for(&user.identity)
            }
            _ => {
                tracing::warn!(username = %username, "Login failed");
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    /// Issues a token for a configured user without checking a password.
    pub fn issue(&self, username: &str) -> Result<IssuedToken, AuthError> {
        let user = self
            .users
            .get(username)
            .ok_or(AuthError::InvalidCredentials)?;
        self.issue_for(&user.identity)
    }

    fn issue_for(&self, identity: &Identity) -> Result<IssuedToken, AuthError> {
        let expires_at = unix_secs() + self.ttl.as_secs();
        let claims = Claims {
            sub: identity.id.clone(),
            username: identity.username.clone(),
            role: identity.role.clone(),
            exp: expires_at,
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|e| AuthError::Internal(e.to_string()))?;
        let signature = self.sign(&payload)?;

        Ok(IssuedToken {
            token: format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(&payload),
                URL_SAFE_NO_PAD.encode(signature)
            ),
            user: UserInfo::from(identity),
            expires_at,
        })
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| AuthError::Internal(e.to_string()))
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl TokenVerifier for TokenAuthority {
    fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let (payload_b64, signature_b64) = token
            .trim()
            .split_once('.')
            .ok_or(AuthError::InvalidToken)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::InvalidToken)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::InvalidToken)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;
        if claims.exp <= unix_secs() {
            return Err(AuthError::InvalidToken);
        }

        let user = self
            .users
            .get(&claims.username)
            .filter(|u| u.identity.id == claims.sub)
            .ok_or(AuthError::InvalidToken)?;
        Ok(user.identity.clone())
    }
}

/// Hex SHA-256 digest of a password, as stored in `password_sha256`.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Stable user id derived from the username.
pub fn user_id_for(username: &str) -> String {
    let digest = Sha256::digest(format!("webterm-user:{username}").as_bytes());
    hex::encode(&digest[..16])
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
