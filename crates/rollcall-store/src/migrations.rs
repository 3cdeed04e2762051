use rusqlite::{Connection, Transaction};

use crate::DbError;

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Bring the schema up to [`CURRENT_SCHEMA_VERSION`] inside one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<(), DbError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(DbError::Schema(format!(
            "database version {version} is newer than supported schema {CURRENT_SCHEMA_VERSION}"
        )));
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        version += 1;
        apply_migration(&tx, version)?;
        tracing::info!(version, "applied schema migration");
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), DbError> {
    match version {
        1 => Ok(tx.execute_batch(include_str!("schema/v1.sql"))?),
        other => Err(DbError::Schema(format!("no migration for version {other}"))),
    }
}
