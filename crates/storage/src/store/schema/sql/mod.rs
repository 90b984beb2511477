#![forbid(unsafe_code)]

mod activation_log;
mod core;
mod peer_documents;
mod pragmas;
mod selection_entries;

pub(super) fn full_schema_sql() -> String {
    let mut sql = String::new();
    sql.push_str(pragmas::SQL);
    sql.push_str(core::SQL);
    sql.push_str(peer_documents::SQL);
    sql.push_str(selection_entries::SQL);
    sql.push_str(activation_log::SQL);
    sql
}
