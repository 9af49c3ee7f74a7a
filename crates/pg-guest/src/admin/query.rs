// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL statement builders.
//!
//! Identifiers are always double-quoted and literals single-quoted, with the
//! quote character doubled inside. Statements that cannot take bind
//! parameters (DDL) are built here; everything else binds.

use super::models::PgDatabase;

/// Quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
///
/// Backslashes switch to the escape-string form so the result does not
/// depend on `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// `CREATE USER` with a login password.
pub fn create_user(name: &str, password: Option<&str>) -> String {
    match password {
        Some(password) => format!(
            "CREATE USER {} WITH LOGIN ENCRYPTED PASSWORD {}",
            quote_ident(name),
            quote_literal(password)
        ),
        None => format!("CREATE USER {} WITH LOGIN", quote_ident(name)),
    }
}

/// `DROP USER`.
pub fn drop_user(name: &str) -> String {
    format!("DROP USER {}", quote_ident(name))
}

/// `DROP ROLE IF EXISTS`.
pub fn drop_role_if_exists(name: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote_ident(name))
}

/// `ALTER USER ... PASSWORD`.
pub fn alter_password(name: &str, password: &str) -> String {
    format!(
        "ALTER USER {} WITH ENCRYPTED PASSWORD {}",
        quote_ident(name),
        quote_literal(password)
    )
}

/// `ALTER USER ... RENAME TO`.
pub fn rename_user(from: &str, to: &str) -> String {
    format!("ALTER USER {} RENAME TO {}", quote_ident(from), quote_ident(to))
}

/// `CREATE DATABASE` with optional encoding and collation.
pub fn create_database(db: &PgDatabase) -> String {
    let mut sql = format!("CREATE DATABASE {}", quote_ident(&db.name));
    if let Some(charset) = &db.character_set {
        sql.push_str(&format!(" ENCODING = {}", quote_literal(charset)));
    }
    if let Some(collate) = &db.collate {
        sql.push_str(&format!(
            " LC_COLLATE = {0} LC_CTYPE = {0} TEMPLATE template0",
            quote_literal(collate)
        ));
    }
    sql
}

/// `DROP DATABASE`.
pub fn drop_database(name: &str) -> String {
    format!("DROP DATABASE {}", quote_ident(name))
}

/// Grant every database privilege.
pub fn grant_database(database: &str, user: &str) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
        quote_ident(database),
        quote_ident(user)
    )
}

/// Revoke every database privilege.
pub fn revoke_database(database: &str, user: &str) -> String {
    format!(
        "REVOKE ALL PRIVILEGES ON DATABASE {} FROM {}",
        quote_ident(database),
        quote_ident(user)
    )
}

/// `CREATE ROLE` without attributes.
pub fn create_role(name: &str) -> String {
    format!("CREATE ROLE {}", quote_ident(name))
}

/// Give the root role the full admin option set and a new password.
pub fn alter_root(name: &str, password: &str) -> String {
    format!(
        "ALTER ROLE {} WITH SUPERUSER CREATEDB CREATEROLE INHERIT REPLICATION BYPASSRLS LOGIN \
         PASSWORD {}",
        quote_ident(name),
        quote_literal(password)
    )
}

/// Create the streaming replication role.
pub fn create_replication_role(name: &str, password: &str) -> String {
    format!(
        "CREATE USER {} WITH REPLICATION SUPERUSER LOGIN ENCRYPTED PASSWORD {}",
        quote_ident(name),
        quote_literal(password)
    )
}

/// Start a base backup on the live engine.
pub fn backup_start(label: &str, major: u32) -> String {
    if major >= 15 {
        format!("SELECT pg_backup_start({}, true)", quote_literal(label))
    } else {
        format!("SELECT pg_start_backup({}, true)", quote_literal(label))
    }
}

/// Stop a base backup started by [`backup_start`].
pub fn backup_stop(major: u32) -> &'static str {
    if major >= 15 {
        "SELECT lsn::text FROM pg_backup_stop()"
    } else {
        "SELECT pg_stop_backup()::text"
    }
}

/// Wrap a query so every row comes back as one JSON text column.
pub fn rows_as_json(statement: &str) -> String {
    format!(
        "SELECT to_jsonb(q)::text FROM ({}) AS q",
        statement.trim().trim_end_matches(';')
    )
}

/// Login roles.
pub const LIST_USERS: &str = "SELECT rolname::text FROM pg_catalog.pg_roles WHERE rolcanlogin";

/// Whether a role exists.
pub const ROLE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)";

/// Non-template databases.
pub const LIST_DATABASES: &str = "SELECT datname::text, pg_encoding_to_char(encoding)::text, \
     datcollate::text FROM pg_catalog.pg_database WHERE NOT datistemplate";

/// Whether a database exists.
pub const DATABASE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1)";

/// Databases a role may create objects in.
pub const LIST_ACCESS: &str = "SELECT datname::text FROM pg_catalog.pg_database \
     WHERE NOT datistemplate AND has_database_privilege($1, datname, 'CREATE')";

/// Superusers other than `$1`.
pub const OTHER_SUPERUSERS: &str =
    "SELECT rolname::text FROM pg_catalog.pg_roles WHERE rolsuper AND rolname <> $1";
