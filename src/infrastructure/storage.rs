use crate::infrastructure::error::InfraError;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const REQUIRED_TABLES: [&str; 2] = ["local_events", "kv_entries"];

/// Applies the schema and checks that every table the stores rely on is present.
pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    let connection = Connection::open(path)?;
    // Several engine instances share this file for the idempotency cache.
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(SCHEMA_SQL)?;

    for table in REQUIRED_TABLES {
        let found: i64 = connection.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        if found == 0 {
            return Err(InfraError::Storage(format!(
                "table {table} missing from {}",
                path.display()
            )));
        }
    }
    Ok(())
}
