use sea_query::{Alias, Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::schema::Violations;
use crate::types::Violation;

/// INSERT INTO violations (id, session_id, timestamp_ms, violation_type, severity, message, source)
/// ON CONFLICT DO NOTHING
///
/// Devices retry reports, so the violation id makes a resend a no-op.
pub fn insert(violation: &Violation) -> String {
    Query::insert()
        .into_table(Violations::Table)
        .columns([
            Violations::Id,
            Violations::SessionId,
            Violations::TimestampMs,
            Violations::ViolationType,
            Violations::Severity,
            Violations::Message,
            Violations::Source,
        ])
        .values_panic([
            violation.id.as_str().into(),
            violation.session_id.as_str().into(),
            violation.timestamp_ms.into(),
            violation.violation_type.as_str().into(),
            violation.severity.as_str().into(),
            violation.message.as_str().into(),
            violation.source.as_str().into(),
        ])
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM violations WHERE session_id = ? ORDER BY timestamp_ms, id
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns([
            Violations::Id,
            Violations::SessionId,
            Violations::TimestampMs,
            Violations::ViolationType,
            Violations::Severity,
            Violations::Message,
            Violations::Source,
        ])
        .from(Violations::Table)
        .and_where(Expr::col(Violations::SessionId).eq(session_id))
        .order_by(Violations::TimestampMs, Order::Asc)
        .order_by(Violations::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT severity, COUNT(*) AS total FROM violations WHERE session_id = ? GROUP BY severity
pub fn count_by_severity(session_id: &str) -> String {
    Query::select()
        .column(Violations::Severity)
        .expr_as(Func::count(Expr::col(Violations::Id)), Alias::new("total"))
        .from(Violations::Table)
        .and_where(Expr::col(Violations::SessionId).eq(session_id))
        .group_by_col(Violations::Severity)
        .to_string(SqliteQueryBuilder)
}
