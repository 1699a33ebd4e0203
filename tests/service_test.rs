//! # Proctoring Service Tests
//!
//! Server-side behavior against an in-memory SQLite database: join tokens,
//! role checks, chunk sequencing, violation idempotency, calibration and the
//! integrity report.
//!
//! ## Running the Tests
//!
//! ```bash
//! cargo test --test service_test
//! ```

use bytes::Bytes;
use pretty_assertions::assert_eq;

use proctor_engine::api::ProctorApi;
use proctor_engine::config::ServerConfig;
use proctor_engine::db;
use proctor_engine::error::{AuthError, ProctorError};
use proctor_engine::types::{
    now_ms, Calibration, CreatedSession, DataLossRisk, DeviceRole, FeedEvent, RecordingChunk,
    RoleConfig, SessionState, Severity, StreamKind, UploadAck, UploadStatus, Violation,
    ViolationType,
};
use proctor_engine::ProctorService;

async fn service() -> ProctorService {
    let pool = db::open_in_memory().await.unwrap();
    ProctorService::new(pool, &ServerConfig::default())
}

async fn session_with_all_roles(service: &ProctorService) -> CreatedSession {
    service
        .create_session(RoleConfig {
            secondary: true,
            reviewer: true,
        })
        .await
        .unwrap()
}

async fn join(service: &ProctorService, session: &CreatedSession, role: DeviceRole) -> String {
    let token = session.token_for(role).unwrap();
    service.exchange_token(token).await.unwrap().credential
}

fn chunk(session_id: &str, role: DeviceRole, kind: StreamKind, sequence: u64, payload: &'static [u8]) -> RecordingChunk {
    RecordingChunk {
        session_id: session_id.to_string(),
        device_role: role,
        kind,
        sequence,
        started_at_ms: now_ms(),
        duration_ms: 2000,
        payload: Bytes::from_static(payload),
        status: UploadStatus::Pending,
    }
}

async fn upload(
    service: &ProctorService,
    credential: &str,
    chunk: RecordingChunk,
) -> proctor_engine::Result<UploadAck> {
    ProctorApi::upload_chunk(service, credential, &chunk).await
}

fn violation(id: &str, violation_type: ViolationType) -> Violation {
    Violation {
        id: id.to_string(),
        session_id: String::new(),
        timestamp_ms: now_ms(),
        violation_type,
        severity: violation_type.default_severity(),
        message: "test".into(),
        source: DeviceRole::Primary,
    }
}

fn assert_auth(err: ProctorError, expected: AuthError) {
    match err {
        ProctorError::Auth(actual) => assert_eq!(actual, expected),
        other => panic!("expected {:?}, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn default_roles_mint_primary_and_reviewer_tokens() {
    let service = service().await;
    let session = service.create_session(RoleConfig::default()).await.unwrap();

    let roles: Vec<DeviceRole> = session.join_tokens.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![DeviceRole::Primary, DeviceRole::Reviewer]);
    assert!(session.token_for(DeviceRole::Secondary).is_none());

    let grant = service
        .exchange_token(session.token_for(DeviceRole::Primary).unwrap())
        .await
        .unwrap();
    assert_eq!(grant.session_id, session.session_id);
    assert_eq!(grant.role, DeviceRole::Primary);
    assert_eq!(grant.relay_url, ServerConfig::default().relay_url);
    assert_eq!(&grant.policy, service.policy());
}

#[tokio::test]
async fn join_tokens_are_single_use() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let token = session.token_for(DeviceRole::Secondary).unwrap();

    service.exchange_token(token).await.unwrap();
    let err = service.exchange_token(token).await.unwrap_err();
    assert_auth(err, AuthError::TokenUsed);

    let err = service.exchange_token("jt_unknown").await.unwrap_err();
    assert_auth(err, AuthError::TokenInvalid);
}

#[tokio::test]
async fn expired_token_is_refused() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let token = session
        .join_tokens
        .iter()
        .find(|t| t.role == DeviceRole::Reviewer)
        .unwrap();

    let err = service
        .registry()
        .exchange_token_at(&token.token, token.expires_at_ms + 1)
        .await
        .unwrap_err();
    assert_auth(err, AuthError::TokenExpired);
}

#[tokio::test]
async fn ended_session_refuses_joins_and_recording_changes() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let primary = join(&service, &session, DeviceRole::Primary).await;

    service.end_session(&primary).await.unwrap();
    let err = service
        .exchange_token(session.token_for(DeviceRole::Reviewer).unwrap())
        .await
        .unwrap_err();
    assert_auth(err, AuthError::SessionEnded);

    let err = service.set_recording(&primary, true).await.unwrap_err();
    assert_auth(err, AuthError::SessionEnded);

    let report = service.session_report(&session.session_id).await.unwrap();
    assert_eq!(report.state, SessionState::Ended);
}

#[tokio::test]
async fn only_primary_and_reviewer_control_recording() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let secondary = join(&service, &session, DeviceRole::Secondary).await;
    let reviewer = join(&service, &session, DeviceRole::Reviewer).await;

    let err = service.set_recording(&secondary, true).await.unwrap_err();
    assert_auth(err, AuthError::RoleNotPermitted("secondary".into()));
    let err = service.end_session(&secondary).await.unwrap_err();
    assert!(matches!(err, ProctorError::Auth(AuthError::RoleNotPermitted(_))));

    assert!(service.set_recording(&reviewer, true).await.unwrap());
    assert!(service.get_recording(&secondary).await.unwrap());
}

#[tokio::test]
async fn reviewer_cannot_upload_chunks() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let reviewer = join(&service, &session, DeviceRole::Reviewer).await;

    let err = ProctorApi::upload_chunk(
        &service,
        &reviewer,
        &chunk(&session.session_id, DeviceRole::Reviewer, StreamKind::Webcam, 1, b"x"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ProctorError::Auth(AuthError::RoleNotPermitted(_))));
}

#[tokio::test]
async fn chunk_sequences_strictly_increase() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let primary = join(&service, &session, DeviceRole::Primary).await;
    let id = session.session_id.as_str();
    let accepted = UploadAck {
        accepted: true,
        duplicate: false,
    };
    let duplicate = UploadAck {
        accepted: false,
        duplicate: true,
    };
    let rejected = UploadAck {
        accepted: false,
        duplicate: false,
    };

    let webcam = |seq: u64, payload: &'static [u8]| chunk(id, DeviceRole::Primary, StreamKind::Webcam, seq, payload);
    let upload = |c: RecordingChunk| upload(&service, &primary, c);
    assert_eq!(upload(webcam(1, b"one")).await.unwrap(), accepted);
    assert_eq!(upload(webcam(2, b"two")).await.unwrap(), accepted);
    // retried delivery of an accepted chunk
    assert_eq!(upload(webcam(2, b"two")).await.unwrap(), duplicate);
    assert_eq!(upload(webcam(1, b"one")).await.unwrap(), duplicate);
    // same sequence, different content
    assert_eq!(upload(webcam(2, b"other")).await.unwrap(), rejected);
    // gaps are allowed, going back is not
    assert_eq!(upload(webcam(5, b"five")).await.unwrap(), accepted);
    assert_eq!(upload(webcam(4, b"four")).await.unwrap(), rejected);

    // each kind has its own sequence space
    let screen = chunk(id, DeviceRole::Primary, StreamKind::Screen, 1, b"s1");
    assert_eq!(upload(screen).await.unwrap(), accepted);

    let err = upload(webcam(0, b"zero")).await.unwrap_err();
    assert!(matches!(err, ProctorError::InvalidInput(_)));

    let manifest = service.list_chunks(id).await.unwrap();
    let webcam_sequences: Vec<u64> = manifest
        .iter()
        .filter(|c| c.kind == StreamKind::Webcam)
        .map(|c| c.sequence)
        .collect();
    assert_eq!(webcam_sequences, vec![1, 2, 5]);
}

#[tokio::test]
async fn concurrent_uploads_of_one_sequence_accept_exactly_one() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let primary = join(&service, &session, DeviceRole::Primary).await;
    let id = session.session_id.as_str();
    let webcam = |seq: u64, payload: &'static [u8]| chunk(id, DeviceRole::Primary, StreamKind::Webcam, seq, payload);
    upload(&service, &primary, webcam(1, b"one")).await.unwrap();

    let (a, b, c) = tokio::join!(
        upload(&service, &primary, webcam(2, b"first")),
        upload(&service, &primary, webcam(2, b"second")),
        upload(&service, &primary, webcam(2, b"third")),
    );
    let acks = [a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(acks.iter().filter(|ack| ack.accepted).count(), 1);
    // different content under a taken sequence is never called a duplicate
    assert!(acks.iter().all(|ack| !ack.duplicate));

    let stored: Vec<u64> = service
        .list_chunks(id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.sequence)
        .collect();
    assert_eq!(stored, vec![1, 2]);
}

#[tokio::test]
async fn chunks_must_match_the_credential() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let other = service.create_session(RoleConfig::default()).await.unwrap();
    let primary = join(&service, &session, DeviceRole::Primary).await;

    let wrong_session = chunk(&other.session_id, DeviceRole::Primary, StreamKind::Webcam, 1, b"x");
    assert!(ProctorApi::upload_chunk(&service, &primary, &wrong_session)
        .await
        .is_err());
    let wrong_role = chunk(&session.session_id, DeviceRole::Secondary, StreamKind::Webcam, 1, b"x");
    assert!(ProctorApi::upload_chunk(&service, &primary, &wrong_role)
        .await
        .is_err());
}

#[tokio::test]
async fn violation_reports_are_idempotent_and_attributed() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let secondary = join(&service, &session, DeviceRole::Secondary).await;

    let mut v = violation("v-1", ViolationType::MultipleFacesDetected);
    v.source = DeviceRole::Reviewer;
    service.report_violation(&secondary, &v).await.unwrap();
    service.report_violation(&secondary, &v).await.unwrap();
    service
        .report_violation(&secondary, &violation("", ViolationType::WindowBlur))
        .await
        .unwrap();

    let stored = service.list_violations(&session.session_id).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|v| v.source == DeviceRole::Secondary));
    assert!(stored.iter().all(|v| v.session_id == session.session_id));
    assert!(stored.iter().all(|v| !v.id.is_empty()));
}

#[tokio::test]
async fn first_calibration_wins() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let primary = join(&service, &session, DeviceRole::Primary).await;
    let secondary = join(&service, &session, DeviceRole::Secondary).await;
    let calibration = |yaw: f64| Calibration {
        session_id: String::new(),
        nose_offset_x: yaw / 90.0,
        nose_offset_y: 0.55,
        yaw_deg: yaw,
        pitch_deg: 0.0,
        roll_rad: 0.0,
        captured_at_ms: now_ms(),
    };

    let first = service
        .report_calibration(&primary, &calibration(9.0))
        .await
        .unwrap();
    assert!(first.stored);
    let second = service
        .report_calibration(&secondary, &calibration(27.0))
        .await
        .unwrap();
    assert!(!second.stored);
    assert_eq!(second.baseline.yaw_deg, 9.0);

    let stored = service
        .calibration(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.yaw_deg, 9.0);
}

#[tokio::test]
async fn report_summarizes_session() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let id = session.session_id.as_str();
    let primary = join(&service, &session, DeviceRole::Primary).await;
    let secondary = join(&service, &session, DeviceRole::Secondary).await;

    for seq in 1..=2 {
        let c = chunk(id, DeviceRole::Primary, StreamKind::Webcam, seq, b"p");
        ProctorApi::upload_chunk(&service, &primary, &c).await.unwrap();
    }
    let c = chunk(id, DeviceRole::Secondary, StreamKind::Webcam, 1, b"s");
    ProctorApi::upload_chunk(&service, &secondary, &c).await.unwrap();

    service
        .report_violation(&primary, &violation("a", ViolationType::TabSwitch))
        .await
        .unwrap();
    service
        .report_violation(&primary, &violation("b", ViolationType::CopyAttempt))
        .await
        .unwrap();
    service
        .report_data_loss(
            &secondary,
            &DataLossRisk {
                session_id: id.to_string(),
                device_role: DeviceRole::Secondary,
                kind: StreamKind::Webcam,
                sequence: 2,
                reason: "not delivered before teardown".into(),
                recorded_at_ms: now_ms(),
            },
        )
        .await
        .unwrap();

    let report = service.session_report(id).await.unwrap();
    assert_eq!(report.state, SessionState::Active);
    assert!(report.flagged);
    assert!(!report.calibrated);
    assert_eq!(report.data_loss_risks, 1);
    assert_eq!(report.chunks_by_stream.get("primary/webcam"), Some(&2));
    assert_eq!(report.chunks_by_stream.get("secondary/webcam"), Some(&1));
    assert_eq!(
        report.violations_by_severity.get(Severity::Critical.as_str()),
        Some(&1)
    );
    assert_eq!(
        report.violations_by_severity.get(Severity::Warning.as_str()),
        Some(&1)
    );

    let devices = service.list_devices(id).await.unwrap();
    assert_eq!(devices.len(), 2);
}

#[tokio::test]
async fn disconnected_credential_stops_working() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let secondary = join(&service, &session, DeviceRole::Secondary).await;

    service.disconnect(&secondary).await.unwrap();
    let err = service.get_recording(&secondary).await.unwrap_err();
    assert_auth(err, AuthError::CredentialInvalid);
}

#[tokio::test]
async fn live_feed_carries_session_events() {
    let service = service().await;
    let session = session_with_all_roles(&service).await;
    let mut feed = service.subscribe_feed(&session.session_id).await.unwrap();

    let primary = join(&service, &session, DeviceRole::Primary).await;
    service.set_recording(&primary, true).await.unwrap();
    // unchanged flag is not re-announced
    service.set_recording(&primary, true).await.unwrap();
    service
        .report_violation(&primary, &violation("v", ViolationType::FullscreenExit))
        .await
        .unwrap();
    service.end_session(&primary).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = feed.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 4);
    assert!(matches!(
        events[0],
        FeedEvent::DeviceJoined {
            role: DeviceRole::Primary
        }
    ));
    assert!(matches!(
        events[1],
        FeedEvent::RecordingChanged { recording: true }
    ));
    assert!(matches!(&events[2], FeedEvent::Violation(v) if v.violation_type == ViolationType::FullscreenExit));
    assert!(matches!(events[3], FeedEvent::SessionEnded));

    assert!(matches!(
        service.subscribe_feed("missing").await,
        Err(ProctorError::NotFound(_))
    ));
}
