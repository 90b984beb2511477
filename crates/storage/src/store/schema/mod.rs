#![forbid(unsafe_code)]

mod sql;

use super::{StoreError, record_schema_version};
use rusqlite::Connection;

pub(super) fn install(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(&sql::full_schema_sql())?;
    record_schema_version(conn)?;
    Ok(())
}
