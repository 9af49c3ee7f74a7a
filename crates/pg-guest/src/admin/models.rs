// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Users, databases and log positions exchanged with the control plane.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Longest identifier the engine accepts (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Roles owned by the controller or the engine.
pub const RESERVED_USERS: [&str; 3] = ["os_admin", "postgres", "root"];

/// Databases owned by the controller or the engine.
pub const RESERVED_DATABASES: [&str; 4] = ["os_admin", "postgres", "template0", "template1"];

/// Name of the root role.
pub const ROOT_USER: &str = "root";

/// A database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgDatabase {
    /// Database name
    pub name: String,
    /// Encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_set: Option<String>,
    /// Collation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collate: Option<String>,
}

impl PgDatabase {
    /// Database with default encoding and collation.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            character_set: None,
            collate: None,
        }
    }
}

/// A login role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgUser {
    /// Role name
    pub name: String,
    /// Plain-text password; only present on input and on root enablement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client host; accepted for compatibility and ignored by this engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Databases the role may access
    #[serde(default)]
    pub databases: Vec<PgDatabase>,
}

impl PgUser {
    /// User with no password and no databases.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            host: None,
            databases: Vec::new(),
        }
    }
}

/// Changes accepted by `update_attributes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAttributes {
    /// New role name
    #[serde(default)]
    pub name: Option<String>,
    /// New password
    #[serde(default)]
    pub password: Option<String>,
    /// New host; ignored by this engine
    #[serde(default)]
    pub host: Option<String>,
}

/// One page of a sorted listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Marker to pass to fetch the next page
    pub next_marker: Option<String>,
}

/// Anything listed by name.
pub trait Named {
    /// Sort and pagination key.
    fn name(&self) -> &str;
}

impl Named for PgUser {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for PgDatabase {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Slice a listing by marker.
///
/// Items are sorted by name. With `include_marker` the page starts at the
/// marker, otherwise right after it. `next_marker` is the last name on a
/// full page when more items follow.
pub fn paginate<T: Named>(
    mut items: Vec<T>,
    limit: Option<usize>,
    marker: Option<&str>,
    include_marker: bool,
) -> Page<T> {
    items.sort_by(|a, b| a.name().cmp(b.name()));
    if let Some(marker) = marker {
        items.retain(|item| {
            if include_marker {
                item.name() >= marker
            } else {
                item.name() > marker
            }
        });
    }
    let next_marker = match limit {
        Some(limit) if items.len() > limit => {
            items.truncate(limit);
            items.last().map(|item| item.name().to_string())
        }
        _ => None,
    };
    Page { items, next_marker }
}

fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::InvalidInput(format!(
            "name must be 1-{} bytes: '{}'",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidInput("name contains NUL".to_string()));
    }
    Ok(())
}

/// Validate a role name coming from the control plane.
pub fn check_user_name(name: &str) -> Result<()> {
    check_identifier(name)?;
    if RESERVED_USERS.contains(&name) {
        return Err(Error::ReservedName(name.to_string()));
    }
    Ok(())
}

/// Validate a database name coming from the control plane.
pub fn check_database_name(name: &str) -> Result<()> {
    check_identifier(name)?;
    if RESERVED_DATABASES.contains(&name) {
        return Err(Error::ReservedName(name.to_string()));
    }
    Ok(())
}

/// Whether a role is hidden from listings.
pub fn is_reserved_user(name: &str) -> bool {
    RESERVED_USERS.contains(&name) || name.starts_with("pg_")
}

/// Whether a database is hidden from listings.
pub fn is_reserved_database(name: &str) -> bool {
    RESERVED_DATABASES.contains(&name)
}

/// Write-ahead log position (`X/Y` in hex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid LSN '{}'", s));
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
