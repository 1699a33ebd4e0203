use sea_query::{Expr, Query, SqliteQueryBuilder};

use crate::schema::JoinTokens;
use crate::types::DeviceRole;

/// INSERT INTO join_tokens (token, session_id, role, expires_at_ms) VALUES (?, ?, ?, ?)
pub fn insert(token: &str, session_id: &str, role: DeviceRole, expires_at_ms: i64) -> String {
    Query::insert()
        .into_table(JoinTokens::Table)
        .columns([
            JoinTokens::Token,
            JoinTokens::SessionId,
            JoinTokens::Role,
            JoinTokens::ExpiresAtMs,
        ])
        .values_panic([
            token.into(),
            session_id.into(),
            role.as_str().into(),
            expires_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// UPDATE join_tokens SET used_at_ms = ?
/// WHERE token = ? AND used_at_ms IS NULL AND expires_at_ms > ?
///
/// Affects exactly one row only for the first exchange of a live token.
pub fn consume(token: &str, now_ms: i64) -> String {
    Query::update()
        .table(JoinTokens::Table)
        .value(JoinTokens::UsedAtMs, now_ms)
        .and_where(Expr::col(JoinTokens::Token).eq(token))
        .and_where(Expr::col(JoinTokens::UsedAtMs).is_null())
        .and_where(Expr::col(JoinTokens::ExpiresAtMs).gt(now_ms))
        .to_string(SqliteQueryBuilder)
}

/// SELECT session_id, role, expires_at_ms, used_at_ms FROM join_tokens WHERE token = ?
pub fn select_by_token(token: &str) -> String {
    Query::select()
        .columns([
            JoinTokens::SessionId,
            JoinTokens::Role,
            JoinTokens::ExpiresAtMs,
            JoinTokens::UsedAtMs,
        ])
        .from(JoinTokens::Table)
        .and_where(Expr::col(JoinTokens::Token).eq(token))
        .to_string(SqliteQueryBuilder)
}
