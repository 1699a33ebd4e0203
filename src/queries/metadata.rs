use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};

use crate::schema::Metadata;

/// Metadata key holding the schema version the database was created with
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// SELECT value FROM metadata WHERE key = 'schema_version'
pub fn select_schema_version() -> String {
    Query::select()
        .column(Metadata::Value)
        .from(Metadata::Table)
        .and_where(Expr::col(Metadata::Key).eq(SCHEMA_VERSION_KEY))
        .to_string(SqliteQueryBuilder)
}

/// Stamp a fresh database. A concurrent opener that stamped first wins.
pub fn stamp_schema_version(version: &str) -> String {
    Query::insert()
        .into_table(Metadata::Table)
        .columns([Metadata::Key, Metadata::Value])
        .values_panic([SCHEMA_VERSION_KEY.into(), version.into()])
        .on_conflict(OnConflict::column(Metadata::Key).do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}
