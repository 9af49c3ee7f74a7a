// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration file codecs.

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// Flattened configuration: key to scalar (or nested section for hierarchical formats).
pub type ConfigDict = Map<String, Value>;

/// Serialization format of an engine configuration file.
pub trait ConfigCodec: Send + Sync {
    /// Parse file contents into a dict.
    fn parse(&self, text: &str) -> Result<ConfigDict>;

    /// Render a dict into file contents.
    fn render(&self, dict: &ConfigDict) -> String;

    /// Whether dotted keys denote nested sections.
    fn is_hierarchical(&self) -> bool {
        false
    }
}

/// Directives that include other files; never part of the parsed dict.
const INCLUDE_DIRECTIVES: [&str; 3] = ["include", "include_dir", "include_if_exists"];

/// `postgresql.conf` syntax.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresCodec;

impl PostgresCodec {
    fn parse_line(line: &str, lineno: usize) -> Result<Option<(String, Value)>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let key_end = line
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(line.len());
        let key = &line[..key_end];
        if key.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "line {}: missing key",
                lineno
            )));
        }

        let mut rest = line[key_end..].trim_start();
        if let Some(stripped) = rest.strip_prefix('=') {
            rest = stripped.trim_start();
        }

        let (value, trailing) = if let Some(quoted) = rest.strip_prefix('\'') {
            let (text, trailing) = Self::parse_quoted(quoted, lineno)?;
            (Value::String(text), trailing)
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '#')
                .unwrap_or(rest.len());
            let raw = &rest[..end];
            if raw.is_empty() {
                return Err(Error::InvalidConfiguration(format!(
                    "line {}: missing value for '{}'",
                    lineno, key
                )));
            }
            (infer_scalar(raw), &rest[end..])
        };

        let trailing = trailing.trim_start();
        if !trailing.is_empty() && !trailing.starts_with('#') {
            return Err(Error::InvalidConfiguration(format!(
                "line {}: unexpected text after value of '{}': {}",
                lineno, key, trailing
            )));
        }

        if INCLUDE_DIRECTIVES.contains(&key) {
            return Ok(None);
        }
        Ok(Some((key.to_string(), value)))
    }

    /// Unescape a quoted value; returns it with the text after the closing quote.
    fn parse_quoted(input: &str, lineno: usize) -> Result<(String, &str)> {
        let mut out = String::new();
        let mut chars = input.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            match c {
                '\'' if chars.peek().map(|(_, next)| *next) == Some('\'') => {
                    chars.next();
                    out.push('\'');
                }
                '\'' => return Ok((out, &input[idx + 1..])),
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                other => out.push(other),
            }
        }
        Err(Error::InvalidConfiguration(format!(
            "line {}: unterminated quoted value",
            lineno
        )))
    }

    fn render_value(value: &Value) -> String {
        match value {
            Value::String(s) => quote(s),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Null => "''".to_string(),
            other => quote(&other.to_string()),
        }
    }
}

impl ConfigCodec for PostgresCodec {
    fn parse(&self, text: &str) -> Result<ConfigDict> {
        let mut dict = ConfigDict::new();
        for (idx, line) in text.lines().enumerate() {
            if let Some((key, value)) = Self::parse_line(line, idx + 1)? {
                dict.insert(key, value);
            }
        }
        Ok(dict)
    }

    fn render(&self, dict: &ConfigDict) -> String {
        let mut out = String::new();
        for (key, value) in flatten(dict) {
            out.push_str(&key);
            out.push_str(" = ");
            out.push_str(&Self::render_value(&value));
            out.push('\n');
        }
        out
    }
}

/// Render the include directive pulling in every `conf.d/*.conf` revision.
pub fn include_dir_directive(dir: &str) -> String {
    format!("include_dir = {}\n", quote(dir))
}

/// Whether `text` already carries an `include_dir` directive.
pub fn has_include_dir(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim_start();
        line.strip_prefix("include_dir")
            .map(|rest| rest.starts_with(|c: char| c.is_whitespace() || c == '='))
            .unwrap_or(false)
    })
}

/// Quote a string value; backslash and quote are both escaped.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

/// Turn an unquoted token into a typed scalar.
pub fn infer_scalar(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => return Value::Bool(true),
        "off" | "false" | "no" => return Value::Bool(false),
        _ => {}
    }
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    let leading_zero = digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.");
    if !leading_zero {
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Number(i.into());
        }
        if raw.contains('.')
            && let Ok(f) = raw.parse::<f64>()
            && let Some(n) = Number::from_f64(f)
        {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Deep right-biased merge of `source` into `target`.
pub fn merge_into(target: &mut ConfigDict, source: &ConfigDict) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Flatten nested sections into dotted keys.
pub fn flatten(dict: &ConfigDict) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in dict {
        match value {
            Value::Object(inner) => {
                for (sub_key, sub_value) in flatten(inner) {
                    out.push((format!("{}.{}", key, sub_key), sub_value));
                }
            }
            other => out.push((key.clone(), other.clone())),
        }
    }
    out
}

/// Expand dotted keys into nested sections (`a.b = 1` becomes `{a: {b: 1}}`).
pub fn expand_dotted_keys(dict: &ConfigDict) -> ConfigDict {
    let mut out = ConfigDict::new();
    for (key, value) in dict {
        let mut parts: Vec<&str> = key.split('.').collect();
        let leaf = parts.pop().unwrap_or_default().to_string();
        let mut section = ConfigDict::new();
        section.insert(leaf, value.clone());
        while let Some(part) = parts.pop() {
            let mut outer = ConfigDict::new();
            outer.insert(part.to_string(), Value::Object(section));
            section = outer;
        }
        merge_into(&mut out, &section);
    }
    out
}

/// Validate override input coming from the control plane.
///
/// Keys must be non-empty and free of whitespace and `=`; values must be
/// scalars (flat codecs) or scalars/sections (hierarchical codecs).
pub fn validate_overrides(kv: &ConfigDict, hierarchical: bool) -> Result<()> {
    for (key, value) in kv {
        if key.trim().is_empty() || key.contains(|c: char| c.is_whitespace() || c == '=') {
            return Err(Error::InvalidConfiguration(format!("invalid key '{}'", key)));
        }
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
            Value::Object(inner) if hierarchical => validate_overrides(inner, hierarchical)?,
            _ => {
                return Err(Error::InvalidConfiguration(format!(
                    "value for '{}' must be a scalar",
                    key
                )));
            }
        }
    }
    Ok(())
}

/// Render a scalar the way it is compared and reported (`get_value`).
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict(value: Value) -> ConfigDict {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_postgres_syntax() {
        let text = "\
# comment
listen_addresses='*'
port=5432
shared_buffers = 128MB   # trailing comment
fsync on
log_line_prefix = '%m [%p] it''s'
log_file_mode = 0644
random_page_cost = 1.1
include_dir = 'conf.d'
";
        let parsed = PostgresCodec.parse(text).unwrap();
        assert_eq!(parsed["listen_addresses"], json!("*"));
        assert_eq!(parsed["port"], json!(5432));
        assert_eq!(parsed["shared_buffers"], json!("128MB"));
        assert_eq!(parsed["fsync"], json!(true));
        assert_eq!(parsed["log_line_prefix"], json!("%m [%p] it's"));
        assert_eq!(parsed["log_file_mode"], json!("0644"));
        assert_eq!(parsed["random_page_cost"], json!(1.1));
        assert!(!parsed.contains_key("include_dir"));
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        let err = PostgresCodec.parse("a = 'open").unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_render_then_parse_preserves_values() {
        let original = dict(json!({
            "work_mem": "16MB",
            "max_connections": 100,
            "hot_standby": true,
            "primary_conninfo": "host=10.0.0.1 password='x'"
        }));
        let rendered = PostgresCodec.render(&original);
        assert!(rendered.contains("hot_standby = true\n"));
        assert!(rendered.contains("max_connections = 100\n"));
        assert_eq!(PostgresCodec.parse(&rendered).unwrap(), original);
    }

    #[test]
    fn test_backslashes_and_quotes_survive_render() {
        let original = dict(json!({
            "log_line_prefix": r"a\b",
            "archive_command": r"cp '%p' C:\wal\%f",
            "primary_conninfo": r"host=h password='x\'y\\z'"
        }));
        let rendered = PostgresCodec.render(&original);
        assert!(rendered.contains(r"log_line_prefix = 'a\\b'"));
        assert!(rendered.contains(r"primary_conninfo = 'host=h password=''x\\''y\\\\z'''"));
        assert_eq!(PostgresCodec.parse(&rendered).unwrap(), original);
    }

    #[test]
    fn test_parse_rejects_text_after_value() {
        let err = PostgresCodec
            .parse(r"primary_conninfo = 'host=h password=''x\''y'''")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        let err = PostgresCodec.parse("work_mem = '4MB' junk").unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        let err = PostgresCodec.parse("work_mem = 4MB junk").unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));

        let parsed = PostgresCodec
            .parse("work_mem = '4MB'  # note\nport = 5432#inline\n")
            .unwrap();
        assert_eq!(parsed["work_mem"], json!("4MB"));
        assert_eq!(parsed["port"], json!(5432));
    }

    #[test]
    fn test_merge_is_right_biased_and_deep() {
        let mut base = dict(json!({"a": 1, "s": {"x": 1, "y": 2}}));
        merge_into(&mut base, &dict(json!({"a": 2, "s": {"y": 3}})));
        assert_eq!(Value::Object(base), json!({"a": 2, "s": {"x": 1, "y": 3}}));
    }

    #[test]
    fn test_expand_dotted_keys() {
        let expanded = expand_dotted_keys(&dict(json!({"net.port": 1, "net.bind": "x", "top": true})));
        assert_eq!(
            Value::Object(expanded),
            json!({"net": {"port": 1, "bind": "x"}, "top": true})
        );
    }

    #[test]
    fn test_validate_overrides() {
        assert!(validate_overrides(&dict(json!({"work_mem": "4MB"})), false).is_ok());
        assert!(validate_overrides(&dict(json!({"bad key": 1})), false).is_err());
        assert!(validate_overrides(&dict(json!({"k": [1, 2]})), false).is_err());
        assert!(validate_overrides(&dict(json!({"k": {"a": 1}})), false).is_err());
        assert!(validate_overrides(&dict(json!({"k": {"a": 1}})), true).is_ok());
    }

    #[test]
    fn test_has_include_dir() {
        assert!(has_include_dir("port = 1\ninclude_dir = 'conf.d'\n"));
        assert!(has_include_dir("include_dir 'conf.d'"));
        assert!(!has_include_dir("include_dirx = 1"));
    }
}
