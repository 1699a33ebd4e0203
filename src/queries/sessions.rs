use sea_query::{Expr, Query, SqliteQueryBuilder};

use crate::schema::Sessions;
use crate::types::SessionState;

/// INSERT INTO sessions (id, created_at_ms, recording, state) VALUES (?, ?, 0, 'active')
pub fn insert(id: &str, created_at_ms: i64) -> String {
    Query::insert()
        .into_table(Sessions::Table)
        .columns([
            Sessions::Id,
            Sessions::CreatedAtMs,
            Sessions::Recording,
            Sessions::State,
        ])
        .values_panic([
            id.into(),
            created_at_ms.into(),
            0i32.into(),
            SessionState::Active.as_str().into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, created_at_ms, recording, state, ended_at_ms FROM sessions WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns([
            Sessions::Id,
            Sessions::CreatedAtMs,
            Sessions::Recording,
            Sessions::State,
            Sessions::EndedAtMs,
        ])
        .from(Sessions::Table)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE sessions SET recording = ? WHERE id = ? AND state = 'active'
pub fn update_recording(id: &str, recording: bool) -> String {
    Query::update()
        .table(Sessions::Table)
        .value(Sessions::Recording, recording as i32)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .and_where(Expr::col(Sessions::State).eq(SessionState::Active.as_str()))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE sessions SET state = 'ended', recording = 0, ended_at_ms = ? WHERE id = ? AND state = 'active'
pub fn end(id: &str, ended_at_ms: i64) -> String {
    Query::update()
        .table(Sessions::Table)
        .value(Sessions::State, SessionState::Ended.as_str())
        .value(Sessions::Recording, 0i32)
        .value(Sessions::EndedAtMs, ended_at_ms)
        .and_where(Expr::col(Sessions::Id).eq(id))
        .and_where(Expr::col(Sessions::State).eq(SessionState::Active.as_str()))
        .to_string(SqliteQueryBuilder)
}
