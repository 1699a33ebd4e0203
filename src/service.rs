//! Server-side proctoring service
//!
//! Owns the registry, the chunk store, the violation/analysis/data-loss sinks
//! and one live feed per session. Every device-facing operation authenticates
//! the bearer credential first and derives the session and role from it, so a
//! device can never write into another session.

use dashmap::DashMap;
use log::{debug, info, warn};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::chunk_wire::WireChunk;
use crate::config::{ProctorPolicy, ServerConfig};
use crate::db;
use crate::error::{AuthError, ProctorError, Result};
use crate::queries::{analysis, chunks, data_loss, violations};
use crate::registry::{AuthenticatedDevice, DeviceEntry, SessionRegistry};
use crate::types::{
    now_ms, AnalysisSample, Calibration, CalibrationAck, ChunkManifestEntry, CreatedSession, DataLossRisk,
    FeedEvent, JoinGrant, RoleConfig, Severity, SessionReport, UploadAck, Violation,
};

pub struct ProctorService {
    pool: SqlitePool,
    registry: SessionRegistry,
    feeds: DashMap<String, broadcast::Sender<FeedEvent>>,
    feed_capacity: usize,
}

impl ProctorService {
    pub fn new(pool: SqlitePool, config: &ServerConfig) -> Self {
        let registry = SessionRegistry::new(
            pool.clone(),
            config.relay_url.clone(),
            config.token_ttl(),
            config.policy.clone(),
        );
        Self {
            pool,
            registry,
            feeds: DashMap::new(),
            feed_capacity: config.feed_capacity,
        }
    }

    /// Open the configured database file and build the service on it
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        let pool = db::open_database(&config.database_path).await?;
        Ok(Self::new(pool, config))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ProctorPolicy {
        self.registry.policy()
    }

    fn publish(&self, session_id: &str, event: FeedEvent) {
        if let Some(sender) = self.feeds.get(session_id) {
            // No receivers is not an error: nobody is watching yet
            let _ = sender.send(event);
        }
    }

    /// Subscribe to the live feed of a session
    pub async fn subscribe_feed(&self, session_id: &str) -> Result<broadcast::Receiver<FeedEvent>> {
        self.registry.session(session_id).await?;
        let sender = self
            .feeds
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.feed_capacity).0);
        Ok(sender.subscribe())
    }

    pub async fn create_session(&self, roles: RoleConfig) -> Result<CreatedSession> {
        self.registry.create(roles).await
    }

    pub async fn exchange_token(&self, token: &str) -> Result<JoinGrant> {
        let grant = self.registry.exchange_token(token).await?;
        self.publish(
            &grant.session_id,
            FeedEvent::DeviceJoined { role: grant.role },
        );
        Ok(grant)
    }

    /// Authenticate and refresh the device's last-seen time
    async fn device(&self, credential: &str) -> Result<AuthenticatedDevice> {
        let device = self.registry.authenticate(credential).await?;
        self.registry.touch(credential).await?;
        Ok(device)
    }

    pub async fn get_recording(&self, credential: &str) -> Result<bool> {
        let device = self.device(credential).await?;
        Ok(self.registry.session(&device.session_id).await?.recording)
    }

    /// Set the authoritative recording flag (primary and reviewer only).
    /// Returns the stored value.
    pub async fn set_recording(&self, credential: &str, recording: bool) -> Result<bool> {
        let device = self.device(credential).await?;
        if !device.role.controls_recording() {
            return Err(AuthError::RoleNotPermitted(device.role.to_string()).into());
        }
        let before = self.registry.session(&device.session_id).await?;
        if !before.is_active() {
            return Err(AuthError::SessionEnded.into());
        }
        self.registry
            .set_recording(&device.session_id, recording)
            .await?;
        if before.recording != recording {
            info!(
                "[Service] Session {} recording {} by {}",
                device.session_id,
                if recording { "started" } else { "stopped" },
                device.role
            );
            self.publish(
                &device.session_id,
                FeedEvent::RecordingChanged { recording },
            );
        }
        Ok(recording)
    }

    /// Store one chunk.
    ///
    /// Sequences must strictly increase per (session, role, kind). A sequence
    /// at or below the last stored one is acknowledged as a duplicate when the
    /// same key holds the same checksum, and rejected otherwise.
    pub async fn upload_chunk(&self, credential: &str, chunk: WireChunk) -> Result<UploadAck> {
        let device = self.device(credential).await?;
        if chunk.session_id != device.session_id || chunk.device_role != device.role {
            return Err(AuthError::RoleNotPermitted(format!(
                "{} of session {}",
                chunk.device_role, chunk.session_id
            ))
            .into());
        }
        if !device.role.captures() {
            return Err(AuthError::RoleNotPermitted(device.role.to_string()).into());
        }
        if chunk.sequence == 0 {
            return Err(ProctorError::InvalidInput(
                "chunk sequences start at 1".into(),
            ));
        }

        // the ordering check and the insert must see the same table
        let mut tx = self.pool.begin().await?;
        let max: Option<i64> = sqlx::query(&chunks::select_max_sequence(
            &chunk.session_id,
            chunk.device_role,
            chunk.kind,
        ))
        .fetch_one(&mut *tx)
        .await?
        .try_get(0)?;

        if let Some(max) = max {
            if chunk.sequence <= max as u64 {
                let stored: Option<i64> = sqlx::query(&chunks::select_checksum(
                    &chunk.session_id,
                    chunk.device_role,
                    chunk.kind,
                    chunk.sequence,
                ))
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get(0))
                .transpose()?;
                tx.rollback().await?;

                return Ok(match stored {
                    Some(checksum) if checksum as u32 == chunk.checksum => {
                        debug!(
                            "[Service] Duplicate {} chunk #{} from {}",
                            chunk.kind, chunk.sequence, chunk.device_role
                        );
                        UploadAck {
                            accepted: false,
                            duplicate: true,
                        }
                    }
                    _ => {
                        warn!(
                            "[Service] Rejected {} chunk #{} from {} (last accepted #{})",
                            chunk.kind, chunk.sequence, chunk.device_role, max
                        );
                        UploadAck {
                            accepted: false,
                            duplicate: false,
                        }
                    }
                });
            }
        }

        let inserted = sqlx::query(&chunks::insert_or_ignore(
            &chunk.session_id,
            chunk.device_role,
            chunk.kind,
            chunk.sequence,
            chunk.started_at_ms,
            chunk.duration_ms,
            chunk.checksum,
            &chunk.payload,
            now_ms(),
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        Ok(UploadAck {
            accepted: inserted > 0,
            duplicate: inserted == 0,
        })
    }

    /// Persist a violation and push it to the live feed.
    /// Session and source always come from the credential.
    pub async fn report_violation(&self, credential: &str, violation: &Violation) -> Result<()> {
        let device = self.device(credential).await?;
        let mut violation = violation.clone();
        violation.session_id = device.session_id.clone();
        violation.source = device.role;
        if violation.id.is_empty() {
            violation.id = uuid::Uuid::new_v4().to_string();
        }

        let inserted = sqlx::query(&violations::insert(&violation))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if inserted > 0 {
            if violation.severity == Severity::Critical {
                warn!(
                    "[Service] Critical violation in session {}: {} ({})",
                    violation.session_id, violation.violation_type, violation.message
                );
            }
            self.publish(&device.session_id, FeedEvent::Violation(violation));
        }
        Ok(())
    }

    pub async fn report_analysis(&self, credential: &str, sample: &AnalysisSample) -> Result<()> {
        let device = self.device(credential).await?;
        let mut sample = sample.clone();
        sample.session_id = device.session_id.clone();
        sample.source = device.role;
        sqlx::query(&analysis::insert_sample(&sample))
            .execute(&self.pool)
            .await?;
        self.publish(&device.session_id, FeedEvent::Analysis(sample));
        Ok(())
    }

    /// Store the session calibration unless one exists, and answer with the
    /// baseline every device of the session must score against.
    pub async fn report_calibration(
        &self,
        credential: &str,
        calibration: &Calibration,
    ) -> Result<CalibrationAck> {
        let device = self.device(credential).await?;
        let mut calibration = calibration.clone();
        calibration.session_id = device.session_id.clone();
        let inserted = sqlx::query(&analysis::insert_calibration_or_ignore(&calibration))
            .execute(&self.pool)
            .await?
            .rows_affected();
        if inserted > 0 {
            info!(
                "[Service] Session {} calibrated by {}",
                device.session_id, device.role
            );
        }
        let baseline = self
            .calibration(&device.session_id)
            .await?
            .ok_or_else(|| ProctorError::NotFound(format!("calibration of {}", device.session_id)))?;
        Ok(CalibrationAck {
            stored: inserted > 0,
            baseline,
        })
    }

    pub async fn report_data_loss(&self, credential: &str, risk: &DataLossRisk) -> Result<()> {
        let device = self.device(credential).await?;
        let mut risk = risk.clone();
        risk.session_id = device.session_id.clone();
        risk.device_role = device.role;
        warn!(
            "[Service] Data loss risk in session {}: {} {} #{} ({})",
            risk.session_id, risk.device_role, risk.kind, risk.sequence, risk.reason
        );
        sqlx::query(&data_loss::insert(&risk))
            .execute(&self.pool)
            .await?;
        self.publish(&device.session_id, FeedEvent::DataLoss(risk));
        Ok(())
    }

    pub async fn disconnect(&self, credential: &str) -> Result<()> {
        let device = self.registry.disconnect(credential).await?;
        self.publish(
            &device.session_id,
            FeedEvent::DeviceLeft { role: device.role },
        );
        Ok(())
    }

    /// End the credential's session (primary and reviewer only)
    pub async fn end_session(&self, credential: &str) -> Result<()> {
        let device = self.device(credential).await?;
        if !device.role.controls_recording() {
            return Err(AuthError::RoleNotPermitted(device.role.to_string()).into());
        }
        if self.registry.end(&device.session_id).await? {
            self.publish(&device.session_id, FeedEvent::SessionEnded);
            self.feeds.remove(&device.session_id);
        }
        Ok(())
    }

    /// End a session addressed by id; the credential must belong to it
    pub async fn end_session_by_id(&self, session_id: &str, credential: &str) -> Result<()> {
        let device = self.registry.authenticate(credential).await?;
        if device.session_id != session_id {
            return Err(AuthError::CredentialInvalid.into());
        }
        self.end_session(credential).await
    }

    pub async fn list_violations(&self, session_id: &str) -> Result<Vec<Violation>> {
        self.registry.session(session_id).await?;
        let rows = sqlx::query(&violations::select_by_session(session_id))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Violation> {
                Ok(Violation {
                    id: row.try_get("id")?,
                    session_id: row.try_get("session_id")?,
                    timestamp_ms: row.try_get("timestamp_ms")?,
                    violation_type: row.try_get::<String, _>("violation_type")?.parse()?,
                    severity: row.try_get::<String, _>("severity")?.parse()?,
                    message: row.try_get("message")?,
                    source: row.try_get::<String, _>("source")?.parse()?,
                })
            })
            .collect()
    }

    /// Chunk manifest without payloads
    pub async fn list_chunks(&self, session_id: &str) -> Result<Vec<ChunkManifestEntry>> {
        self.registry.session(session_id).await?;
        let rows = sqlx::query(&chunks::select_manifest(session_id))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<ChunkManifestEntry> {
                Ok(ChunkManifestEntry {
                    device_role: row.try_get::<String, _>("device_role")?.parse()?,
                    kind: row.try_get::<String, _>("kind")?.parse()?,
                    sequence: row.try_get::<i64, _>("sequence")? as u64,
                    started_at_ms: row.try_get("started_at_ms")?,
                    duration_ms: row.try_get::<i64, _>("duration_ms")? as u32,
                    size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
                })
            })
            .collect()
    }

    pub async fn list_devices(&self, session_id: &str) -> Result<Vec<DeviceEntry>> {
        self.registry.session(session_id).await?;
        self.registry.devices(session_id).await
    }

    pub async fn calibration(&self, session_id: &str) -> Result<Option<Calibration>> {
        let row = sqlx::query(&analysis::select_calibration(session_id))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Calibration> {
            Ok(Calibration {
                session_id: row.try_get("session_id")?,
                nose_offset_x: row.try_get("nose_offset_x")?,
                nose_offset_y: row.try_get("nose_offset_y")?,
                yaw_deg: row.try_get("yaw_deg")?,
                pitch_deg: row.try_get("pitch_deg")?,
                roll_rad: row.try_get("roll_rad")?,
                captured_at_ms: row.try_get("captured_at_ms")?,
            })
        })
        .transpose()
    }

    pub async fn data_loss_risks(&self, session_id: &str) -> Result<Vec<DataLossRisk>> {
        let rows = sqlx::query(&data_loss::select_by_session(session_id))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<DataLossRisk> {
                Ok(DataLossRisk {
                    session_id: row.try_get("session_id")?,
                    device_role: row.try_get::<String, _>("device_role")?.parse()?,
                    kind: row.try_get::<String, _>("kind")?.parse()?,
                    sequence: row.try_get::<i64, _>("sequence")? as u64,
                    reason: row.try_get("reason")?,
                    recorded_at_ms: row.try_get("recorded_at_ms")?,
                })
            })
            .collect()
    }

    /// Integrity summary for a session
    pub async fn session_report(&self, session_id: &str) -> Result<SessionReport> {
        let session = self.registry.session(session_id).await?;

        let mut violations_by_severity = BTreeMap::new();
        for row in sqlx::query(&violations::count_by_severity(session_id))
            .fetch_all(&self.pool)
            .await?
        {
            let severity: String = row.try_get("severity")?;
            let total: i64 = row.try_get("total")?;
            violations_by_severity.insert(severity, total as u64);
        }

        let mut chunks_by_stream = BTreeMap::new();
        for row in sqlx::query(&chunks::count_by_stream(session_id))
            .fetch_all(&self.pool)
            .await?
        {
            let role: String = row.try_get("device_role")?;
            let kind: String = row.try_get("kind")?;
            let total: i64 = row.try_get("total")?;
            chunks_by_stream.insert(format!("{}/{}", role, kind), total as u64);
        }

        let data_loss_risks: i64 = sqlx::query(&data_loss::count_by_session(session_id))
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let flagged = violations_by_severity
            .get(Severity::Critical.as_str())
            .is_some_and(|n| *n > 0);

        Ok(SessionReport {
            session_id: session.id,
            state: session.state,
            recording: session.recording,
            violations_by_severity,
            chunks_by_stream,
            data_loss_risks: data_loss_risks as u64,
            calibrated: self.calibration(session_id).await?.is_some(),
            flagged,
        })
    }
}

