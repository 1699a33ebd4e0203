use sea_query::{Alias, Expr, Func, Order, Query, SqliteQueryBuilder};

use crate::schema::DataLossRisks;
use crate::types::DataLossRisk;

/// INSERT INTO data_loss_risks (session_id, device_role, kind, sequence, reason, recorded_at_ms)
pub fn insert(risk: &DataLossRisk) -> String {
    Query::insert()
        .into_table(DataLossRisks::Table)
        .columns([
            DataLossRisks::SessionId,
            DataLossRisks::DeviceRole,
            DataLossRisks::Kind,
            DataLossRisks::Sequence,
            DataLossRisks::Reason,
            DataLossRisks::RecordedAtMs,
        ])
        .values_panic([
            risk.session_id.as_str().into(),
            risk.device_role.as_str().into(),
            risk.kind.as_str().into(),
            (risk.sequence as i64).into(),
            risk.reason.as_str().into(),
            risk.recorded_at_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) AS total FROM data_loss_risks WHERE session_id = ?
pub fn count_by_session(session_id: &str) -> String {
    Query::select()
        .expr_as(Func::count(Expr::col(DataLossRisks::Id)), Alias::new("total"))
        .from(DataLossRisks::Table)
        .and_where(Expr::col(DataLossRisks::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM data_loss_risks WHERE session_id = ? ORDER BY id
pub fn select_by_session(session_id: &str) -> String {
    Query::select()
        .columns([
            DataLossRisks::SessionId,
            DataLossRisks::DeviceRole,
            DataLossRisks::Kind,
            DataLossRisks::Sequence,
            DataLossRisks::Reason,
            DataLossRisks::RecordedAtMs,
        ])
        .from(DataLossRisks::Table)
        .and_where(Expr::col(DataLossRisks::SessionId).eq(session_id))
        .order_by(DataLossRisks::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}
