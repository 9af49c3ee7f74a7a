// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client authentication ruleset (`pg_hba.conf`).

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::os::{self, MODE_SECRET, Owner};

/// One row of the ruleset. The first matching row decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HbaRule {
    /// Connection kind: `local`, `host`, `hostssl`, `hostnossl`
    pub kind: String,
    /// Database column
    pub database: String,
    /// User column
    pub user: String,
    /// Address column; absent for `local`
    pub address: Option<String>,
    /// Auth method plus options
    pub method: String,
}

impl HbaRule {
    /// A `local` rule.
    pub fn local(database: &str, user: &str, method: &str) -> Self {
        Self {
            kind: "local".to_string(),
            database: database.to_string(),
            user: user.to_string(),
            address: None,
            method: method.to_string(),
        }
    }

    /// A `host` rule.
    pub fn host(database: &str, user: &str, address: &str, method: &str) -> Self {
        Self {
            kind: "host".to_string(),
            database: database.to_string(),
            user: user.to_string(),
            address: Some(address.to_string()),
            method: method.to_string(),
        }
    }

    /// Rule letting the replication role stream from anywhere with a password.
    pub fn replication(user: &str) -> Self {
        Self::host("replication", user, "0.0.0.0/0", "md5")
    }

    fn parse(line: &str, lineno: usize) -> Result<Option<Self>> {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            return Ok(None);
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let invalid = || Error::InvalidConfiguration(format!("pg_hba line {}: '{}'", lineno, line));
        let rule = match fields.first().copied() {
            Some("local") if fields.len() >= 4 => Self {
                kind: fields[0].to_string(),
                database: fields[1].to_string(),
                user: fields[2].to_string(),
                address: None,
                method: fields[3..].join(" "),
            },
            Some(kind) if kind.starts_with("host") && fields.len() >= 5 => Self {
                kind: kind.to_string(),
                database: fields[1].to_string(),
                user: fields[2].to_string(),
                address: Some(fields[3].to_string()),
                method: fields[4..].join(" "),
            },
            _ => return Err(invalid()),
        };
        Ok(Some(rule))
    }
}

impl fmt::Display for HbaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind, self.database, self.user)?;
        if let Some(address) = &self.address {
            write!(f, " {}", address)?;
        }
        write!(f, " {}", self.method)
    }
}

/// Ordered ruleset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HbaRuleset {
    rules: Vec<HbaRule>,
}

impl HbaRuleset {
    /// Rules installed on every fresh instance.
    ///
    /// The admin roles are trusted on the local socket and loopback; every
    /// other role needs a password.
    pub fn defaults(admin_user: &str) -> Self {
        let admins = format!("postgres,{}", admin_user);
        Self {
            rules: vec![
                HbaRule::local("all", &admins, "trust"),
                HbaRule::local("all", "all", "md5"),
                HbaRule::host("all", &admins, "127.0.0.1/32", "trust"),
                HbaRule::host("all", &admins, "::1/128", "trust"),
                HbaRule::host("all", &admins, "localhost", "trust"),
                HbaRule::host("all", "all", "0.0.0.0/0", "md5"),
                HbaRule::host("all", "all", "::/0", "md5"),
            ],
        }
    }

    /// Parse a ruleset file body.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if let Some(rule) = HbaRule::parse(line, idx + 1)? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[HbaRule] {
        &self.rules
    }

    /// Whether an identical rule is present.
    pub fn contains(&self, rule: &HbaRule) -> bool {
        self.rules.contains(rule)
    }

    /// Append `rule` unless present. Returns whether it was added.
    pub fn append_once(&mut self, rule: HbaRule) -> bool {
        if self.contains(&rule) {
            return false;
        }
        self.rules.push(rule);
        true
    }

    /// Render one rule per line, single-space separated.
    pub fn render(&self) -> String {
        self.rules.iter().map(|r| format!("{}\n", r)).collect()
    }

    /// Read a ruleset; a missing file is an empty ruleset.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the ruleset file atomically (owner read/write only).
    pub async fn write(&self, path: &Path, owner: Owner) -> Result<()> {
        os::write_atomic(path, self.render().as_bytes(), owner, MODE_SECRET).await?;
        info!(path = %path.display(), rules = self.rules.len(), "Client auth rules written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_render_without_tabs() {
        let rendered = HbaRuleset::defaults("os_admin").render();
        assert!(!rendered.contains('\t'));
        assert!(rendered.starts_with("local all postgres,os_admin trust\n"));
        assert!(rendered.contains("host all all 0.0.0.0/0 md5\n"));
    }

    #[test]
    fn test_parse_render_round_trip() {
        let ruleset = HbaRuleset::defaults("os_admin");
        assert_eq!(HbaRuleset::parse(&ruleset.render()).unwrap(), ruleset);
    }

    #[test]
    fn test_parse_tolerates_comments_and_tabs() {
        let ruleset =
            HbaRuleset::parse("# TYPE DATABASE USER ADDRESS METHOD\nhost\tall\tall\t10.0.0.0/8\tscram-sha-256 # lan\n")
                .unwrap();
        assert_eq!(
            ruleset.rules(),
            [HbaRule::host("all", "all", "10.0.0.0/8", "scram-sha-256")]
        );
    }

    #[test]
    fn test_parse_rejects_short_rows() {
        assert!(HbaRuleset::parse("host all all\n").is_err());
    }

    #[test]
    fn test_append_once() {
        let mut ruleset = HbaRuleset::defaults("os_admin");
        assert!(ruleset.append_once(HbaRule::replication("replicator")));
        assert!(!ruleset.append_once(HbaRule::replication("replicator")));
        assert!(
            ruleset
                .render()
                .ends_with("host replication replicator 0.0.0.0/0 md5\n")
        );
    }
}
