use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Devices;
use crate::types::DeviceRole;

/// INSERT INTO devices (credential, session_id, role, connected_at_ms, last_seen_ms) VALUES (?, ?, ?, ?, ?)
pub fn insert(credential: &str, session_id: &str, role: DeviceRole, now_ms: i64) -> String {
    Query::insert()
        .into_table(Devices::Table)
        .columns([
            Devices::Credential,
            Devices::SessionId,
            Devices::Role,
            Devices::ConnectedAtMs,
            Devices::LastSeenMs,
        ])
        .values_panic([
            credential.into(),
            session_id.into(),
            role.as_str().into(),
            now_ms.into(),
            now_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT session_id, role FROM devices WHERE credential = ?
pub fn select_by_credential(credential: &str) -> String {
    Query::select()
        .columns([Devices::SessionId, Devices::Role])
        .from(Devices::Table)
        .and_where(Expr::col(Devices::Credential).eq(credential))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE devices SET last_seen_ms = ? WHERE credential = ?
pub fn touch(credential: &str, now_ms: i64) -> String {
    Query::update()
        .table(Devices::Table)
        .value(Devices::LastSeenMs, now_ms)
        .and_where(Expr::col(Devices::Credential).eq(credential))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM devices WHERE credential = ?
pub fn delete(credential: &str) -> String {
    Query::delete()
        .from_table(Devices::Table)
        .and_where(Expr::col(Devices::Credential).eq(credential))
        .to_string(SqliteQueryBuilder)
}

/// SELECT role, connected_at_ms, last_seen_ms FROM devices WHERE session_id = ? ORDER BY connected_at_ms
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns([Devices::Role, Devices::ConnectedAtMs, Devices::LastSeenMs])
        .from(Devices::Table)
        .and_where(Expr::col(Devices::SessionId).eq(session_id))
        .order_by(Devices::ConnectedAtMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
