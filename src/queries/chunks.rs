use sea_query::{Alias, Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::schema::Chunks;
use crate::types::{DeviceRole, StreamKind};

/// INSERT INTO chunks (...) VALUES (...) ON CONFLICT DO NOTHING
///
/// The composite primary key makes a retried upload a no-op.
#[allow(clippy::too_many_arguments)]
pub fn insert_or_ignore(
    session_id: &str,
    device_role: DeviceRole,
    kind: StreamKind,
    sequence: u64,
    started_at_ms: i64,
    duration_ms: u32,
    checksum: u32,
    payload: &[u8],
    received_at_ms: i64,
) -> String {
    Query::insert()
        .into_table(Chunks::Table)
        .columns([
            Chunks::SessionId,
            Chunks::DeviceRole,
            Chunks::Kind,
            Chunks::Sequence,
            Chunks::StartedAtMs,
            Chunks::DurationMs,
            Chunks::Checksum,
            Chunks::Payload,
            Chunks::ReceivedAtMs,
        ])
        .values_panic([
            session_id.into(),
            device_role.as_str().into(),
            kind.as_str().into(),
            (sequence as i64).into(),
            started_at_ms.into(),
            (duration_ms as i64).into(),
            (checksum as i64).into(),
            payload.to_vec().into(),
            received_at_ms.into(),
        ])
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// SELECT MAX(sequence) FROM chunks WHERE session_id = ? AND device_role = ? AND kind = ?
pub fn select_max_sequence(session_id: &str, device_role: DeviceRole, kind: StreamKind) -> String {
    Query::select()
        .expr(Func::max(Expr::col(Chunks::Sequence)))
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .and_where(Expr::col(Chunks::DeviceRole).eq(device_role.as_str()))
        .and_where(Expr::col(Chunks::Kind).eq(kind.as_str()))
        .to_string(SqliteQueryBuilder)
}

/// SELECT checksum FROM chunks WHERE session_id = ? AND device_role = ? AND kind = ? AND sequence = ?
pub fn select_checksum(
    session_id: &str,
    device_role: DeviceRole,
    kind: StreamKind,
    sequence: u64,
) -> String {
    Query::select()
        .column(Chunks::Checksum)
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .and_where(Expr::col(Chunks::DeviceRole).eq(device_role.as_str()))
        .and_where(Expr::col(Chunks::Kind).eq(kind.as_str()))
        .and_where(Expr::col(Chunks::Sequence).eq(sequence as i64))
        .to_string(SqliteQueryBuilder)
}

/// SELECT device_role, kind, sequence, started_at_ms, duration_ms, LENGTH(payload) AS size_bytes
/// FROM chunks WHERE session_id = ? ORDER BY device_role, kind, sequence
pub fn select_manifest(session_id: &str) -> String {
    Query::select()
        .columns([
            Chunks::DeviceRole,
            Chunks::Kind,
            Chunks::Sequence,
            Chunks::StartedAtMs,
            Chunks::DurationMs,
        ])
        .expr_as(
            Func::cust(Alias::new("LENGTH")).arg(Expr::col(Chunks::Payload)),
            Alias::new("size_bytes"),
        )
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .order_by(Chunks::DeviceRole, Order::Asc)
        .order_by(Chunks::Kind, Order::Asc)
        .order_by(Chunks::Sequence, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT device_role, kind, COUNT(*) AS total FROM chunks WHERE session_id = ? GROUP BY device_role, kind
pub fn count_by_stream(session_id: &str) -> String {
    Query::select()
        .columns([Chunks::DeviceRole, Chunks::Kind])
        .expr_as(Func::count(Expr::col(Chunks::Sequence)), Alias::new("total"))
        .from(Chunks::Table)
        .and_where(Expr::col(Chunks::SessionId).eq(session_id))
        .group_by_columns([Chunks::DeviceRole, Chunks::Kind])
        .to_string(SqliteQueryBuilder)
}
