//! Table layout and SQL text for the SQLite visit store.
//!
//! Each partition lives in its own table named `visits/<partition>`:
//!
//! | Column | Type | Meaning |
//! |--------|------|---------|
//! | `visitor_id` | TEXT | Visitor identity |
//! | `path` | TEXT | Site-relative location |
//! | `ip` | TEXT | Client address |
//! | `ua` | TEXT | User agent |
//! | `referrer` | TEXT | Referrer |
//! | `created_at` | INTEGER | Ingestion time, unix milliseconds |
//!
//! Secondary indexes are named after their table with a `#path_ip` or
//! `#ip` suffix.

use visitstat_storage::Partition;

/// Prefix shared by every partition table.
pub(crate) const TABLE_PREFIX: &str = "visits/";

/// Returns the table holding `partition`.
pub(crate) fn table_name(partition: &Partition) -> String {
    format!("{TABLE_PREFIX}{partition}")
}

/// Recovers the partition from a table name, if it is a partition table.
pub(crate) fn partition_from_table(table: &str) -> Option<Partition> {
    table.strip_prefix(TABLE_PREFIX).filter(|p| !p.is_empty()).map(Partition::from)
}

/// Quotes an identifier so any hostname is a valid table name.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn create_table(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            visitor_id TEXT NOT NULL,
            path TEXT NOT NULL,
            ip TEXT NOT NULL,
            ua TEXT NOT NULL DEFAULT '',
            referrer TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )",
        quote_ident(table)
    )
}

pub(crate) fn create_indexes(table: &str) -> String {
    let quoted = quote_ident(table);
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {quoted} (path, ip);
         CREATE INDEX IF NOT EXISTS {} ON {quoted} (ip);",
        quote_ident(&format!("{table}#path_ip")),
        quote_ident(&format!("{table}#ip")),
    )
}

pub(crate) fn insert(table: &str) -> String {
    format!(
        "INSERT INTO {} (visitor_id, path, ip, ua, referrer, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        quote_ident(table)
    )
}

pub(crate) const TABLE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)";

pub(crate) const LIST_TABLES: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND substr(name, 1, 7) = 'visits/' ORDER BY name";

pub(crate) const LIST_INDEXES: &str =
    "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 ORDER BY name";
