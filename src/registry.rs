//! Session registry: sessions, join tokens and device credentials

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::time::Duration;

use crate::config::ProctorPolicy;
use crate::constants::generate_secret;
use crate::error::{AuthError, ProctorError, Result};
use crate::queries::{devices, sessions, tokens};
use crate::types::{
    now_ms, CreatedSession, DeviceRole, JoinGrant, RoleConfig, RoleToken, SessionState,
};

/// Stored session row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at_ms: i64,
    pub recording: bool,
    pub state: SessionState,
    pub ended_at_ms: Option<i64>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// A device resolved from its bearer credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedDevice {
    pub credential: String,
    pub session_id: String,
    pub role: DeviceRole,
}

/// Connected device as listed for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub role: DeviceRole,
    pub connected_at_ms: i64,
    pub last_seen_ms: i64,
}

/// Contents of the secondary-device QR code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrJoin {
    pub server_url: String,
    pub token: String,
}

/// Encode a join link for a phone to scan
pub fn qr_payload(server_url: &str, token: &str) -> String {
    let join = QrJoin {
        server_url: server_url.to_string(),
        token: token.to_string(),
    };
    // Serializing two strings cannot fail
    let json = serde_json::to_vec(&join).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a scanned QR payload
pub fn parse_qr_payload(payload: &str) -> Result<QrJoin> {
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim())
        .map_err(|e| ProctorError::InvalidInput(format!("QR payload is not base64: {}", e)))?;
    let join: QrJoin = serde_json::from_slice(&raw)?;
    if join.token.is_empty() {
        return Err(ProctorError::InvalidInput("QR payload has no token".into()));
    }
    Ok(join)
}

pub struct SessionRegistry {
    pool: SqlitePool,
    relay_url: String,
    token_ttl: Duration,
    policy: ProctorPolicy,
}

impl SessionRegistry {
    pub fn new(
        pool: SqlitePool,
        relay_url: String,
        token_ttl: Duration,
        policy: ProctorPolicy,
    ) -> Self {
        Self {
            pool,
            relay_url,
            token_ttl,
            policy,
        }
    }

    pub fn policy(&self) -> &ProctorPolicy {
        &self.policy
    }

    /// Create a session and mint one join token per configured role.
    /// The primary role always receives a token.
    pub async fn create(&self, roles: RoleConfig) -> Result<CreatedSession> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let created_at_ms = now_ms();
        let expires_at_ms = created_at_ms + self.token_ttl.as_millis() as i64;

        let mut wanted = vec![DeviceRole::Primary];
        if roles.secondary {
            wanted.push(DeviceRole::Secondary);
        }
        if roles.reviewer {
            wanted.push(DeviceRole::Reviewer);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&sessions::insert(&session_id, created_at_ms))
            .execute(&mut *tx)
            .await?;

        let mut join_tokens = Vec::with_capacity(wanted.len());
        for role in wanted {
            let token = generate_secret("jt");
            sqlx::query(&tokens::insert(&token, &session_id, role, expires_at_ms))
                .execute(&mut *tx)
                .await?;
            join_tokens.push(RoleToken {
                role,
                token,
                expires_at_ms,
            });
        }
        tx.commit().await?;

        info!(
            "[Registry] Created session {} with {} join token(s)",
            session_id,
            join_tokens.len()
        );
        Ok(CreatedSession {
            session_id,
            created_at_ms,
            join_tokens,
        })
    }

    pub async fn exchange_token(&self, token: &str) -> Result<JoinGrant> {
        self.exchange_token_at(token, now_ms()).await
    }

    /// Exchange a join token for a device credential as of `now_ms`.
    ///
    /// The token is consumed by a single conditional UPDATE, so of two
    /// concurrent exchanges exactly one wins.
    pub async fn exchange_token_at(&self, token: &str, now_ms: i64) -> Result<JoinGrant> {
        let row = sqlx::query(&tokens::select_by_token(token))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::TokenInvalid)?;
        let session_id: String = row.try_get("session_id")?;
        let role: DeviceRole = row.try_get::<String, _>("role")?.parse()?;
        let expires_at_ms: i64 = row.try_get("expires_at_ms")?;
        let used_at_ms: Option<i64> = row.try_get("used_at_ms")?;

        let session = self.session(&session_id).await?;
        if !session.is_active() {
            return Err(AuthError::SessionEnded.into());
        }

        let consumed = sqlx::query(&tokens::consume(token, now_ms))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if consumed == 0 {
            let err = if used_at_ms.is_none() && expires_at_ms <= now_ms {
                AuthError::TokenExpired
            } else {
                AuthError::TokenUsed
            };
            debug!("[Registry] Token exchange refused for session {}: {}", session_id, err);
            return Err(err.into());
        }

        let credential = generate_secret("dc");
        sqlx::query(&devices::insert(&credential, &session_id, role, now_ms))
            .execute(&self.pool)
            .await?;

        info!("[Registry] {} device joined session {}", role, session_id);
        Ok(JoinGrant {
            relay_url: self.relay_url.clone(),
            credential,
            session_id,
            role,
            policy: self.policy.clone(),
        })
    }

    /// Resolve a bearer credential to its device
    pub async fn authenticate(&self, credential: &str) -> Result<AuthenticatedDevice> {
        let row = sqlx::query(&devices::select_by_credential(credential))
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::CredentialInvalid)?;
        Ok(AuthenticatedDevice {
            credential: credential.to_string(),
            session_id: row.try_get("session_id")?,
            role: row.try_get::<String, _>("role")?.parse()?,
        })
    }

    pub async fn touch(&self, credential: &str) -> Result<()> {
        sqlx::query(&devices::touch(credential, now_ms()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove the device entry. Returns the role that left.
    pub async fn disconnect(&self, credential: &str) -> Result<AuthenticatedDevice> {
        let device = self.authenticate(credential).await?;
        sqlx::query(&devices::delete(credential))
            .execute(&self.pool)
            .await?;
        info!(
            "[Registry] {} device left session {}",
            device.role, device.session_id
        );
        Ok(device)
    }

    pub async fn session(&self, session_id: &str) -> Result<SessionRecord> {
        let row = sqlx::query(&sessions::select_by_id(session_id))
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProctorError::NotFound(format!("session {}", session_id)))?;
        Ok(SessionRecord {
            id: row.try_get("id")?,
            created_at_ms: row.try_get("created_at_ms")?,
            recording: row.try_get::<i64, _>("recording")? != 0,
            state: row.try_get::<String, _>("state")?.parse()?,
            ended_at_ms: row.try_get("ended_at_ms")?,
        })
    }

    /// Set the recording flag. Returns false if the session is not active.
    pub async fn set_recording(&self, session_id: &str, recording: bool) -> Result<bool> {
        let updated = sqlx::query(&sessions::update_recording(session_id, recording))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    /// Move the session to ended. Returns false if it had already ended.
    pub async fn end(&self, session_id: &str) -> Result<bool> {
        let updated = sqlx::query(&sessions::end(session_id, now_ms()))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated > 0 {
            info!("[Registry] Session {} ended", session_id);
        }
        Ok(updated > 0)
    }

    pub async fn devices(&self, session_id: &str) -> Result<Vec<DeviceEntry>> {
        let rows = sqlx::query(&devices::select_by_session(session_id))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<DeviceEntry> {
                Ok(DeviceEntry {
                    role: row.try_get::<String, _>("role")?.parse()?,
                    connected_at_ms: row.try_get("connected_at_ms")?,
                    last_seen_ms: row.try_get("last_seen_ms")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_payload_round_trips() {
        let payload = qr_payload("https://proctor.example.com", "jt_abc123");
        assert!(!payload.contains('+') && !payload.contains('/') && !payload.contains('='));

        let join = parse_qr_payload(&payload).unwrap();
        assert_eq!(join.server_url, "https://proctor.example.com");
        assert_eq!(join.token, "jt_abc123");
    }

    #[test]
    fn qr_payload_rejects_garbage() {
        assert!(matches!(
            parse_qr_payload("not base64!!"),
            Err(ProctorError::InvalidInput(_))
        ));
        let empty_token = URL_SAFE_NO_PAD.encode(br#"{"server_url":"x","token":""}"#);
        assert!(parse_qr_payload(&empty_token).is_err());
    }
}
