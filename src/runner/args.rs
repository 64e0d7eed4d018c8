//! Pure helpers for building a runner command line.
//!
//! - [`tokenize_cli_args`] splits the free-form "extra CLI arguments" string.
//! - [`webhook_ports`] scans a rulebook's sources for declared listener ports,
//!   which container launches must publish.

use std::collections::BTreeSet;

use serde_yaml::Value;

/// Source keys that configure the source itself rather than naming a plugin.
const RESERVED_SOURCE_KEYS: [&str; 2] = ["name", "filters"];

/// Split an argument string on whitespace, keeping double-quoted spans as a
/// single token (quotes included).
///
/// A token is either a run of characters that are neither whitespace nor `"`,
/// or a complete `"..."` span. An unterminated quote is skipped.
///
/// ```
/// use rulebookd::runner::args::tokenize_cli_args;
/// assert_eq!(
///     tokenize_cli_args(r#"--message "hello world" --verbose"#),
///     vec!["--message", "\"hello world\"", "--verbose"],
/// );
/// ```
pub fn tokenize_cli_args(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while let Some(c) = rest.chars().next() {
        if c == '"' {
            if let Some(close) = rest[1..].find('"') {
                let end = close + 2;
                tokens.push(rest[..end].to_string());
                rest = &rest[end..];
            } else {
                rest = &rest[1..];
            }
        } else if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
        } else {
            let end = rest
                .find(|ch: char| ch.is_whitespace() || ch == '"')
                .unwrap_or(rest.len());
            tokens.push(rest[..end].to_string());
            rest = &rest[end..];
        }
    }
    tokens
}

/// Collect every webhook port declared by the rulebook's sources.
///
/// A rulebook is a list of rulesets (a single ruleset mapping is accepted
/// too). For each source object, every key except `name`/`filters` is
/// inspected; when its value is a mapping with a numeric `port`, that port is
/// collected.
pub fn webhook_ports(rulebook: &Value) -> BTreeSet<u16> {
    let rulesets: Vec<&Value> = match rulebook {
        Value::Sequence(items) => items.iter().collect(),
        Value::Mapping(_) => vec![rulebook],
        _ => Vec::new(),
    };

    let mut ports = BTreeSet::new();
    for ruleset in rulesets {
        let Some(Value::Sequence(sources)) = ruleset.get("sources") else {
            continue;
        };
        for source in sources {
            let Value::Mapping(fields) = source else {
                continue;
            };
            for (key, value) in fields {
                if key
                    .as_str()
                    .is_some_and(|k| RESERVED_SOURCE_KEYS.contains(&k))
                {
                    continue;
                }
                let port = value
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok());
                if let Some(port) = port {
                    ports.insert(port);
                }
            }
        }
    }
    ports
}

/// Parse rulebook text (YAML or JSON) and collect its webhook ports.
pub fn webhook_ports_from_source(source: &str) -> Result<BTreeSet<u16>, String> {
    let rulebook: Value =
        serde_yaml::from_str(source).map_err(|e| format!("Invalid rulebook: {e}"))?;
    Ok(webhook_ports(&rulebook))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quoted_span() {
        assert_eq!(
            tokenize_cli_args(r#"--message "hello world" --verbose"#),
            vec!["--message", "\"hello world\"", "--verbose"]
        );
    }

    #[test]
    fn test_tokenize_blank() {
        assert!(tokenize_cli_args("").is_empty());
        assert!(tokenize_cli_args("   \t  ").is_empty());
    }

    #[test]
    fn test_tokenize_quote_glued_to_flag() {
        assert_eq!(
            tokenize_cli_args(r#"--var="a b" -v"#),
            vec!["--var=", "\"a b\"", "-v"]
        );
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert_eq!(tokenize_cli_args(r#"-v "oops"#), vec!["-v", "oops"]);
    }

    #[test]
    fn test_ports_from_two_sources() {
        let rulebook = r"
- name: Listen for events
  hosts: all
  sources:
    - name: primary
      ansible.eda.webhook:
        host: 0.0.0.0
        port: 5000
    - ansible.eda.webhook:
        port: 5001
      filters:
        - ansible.eda.dashes_to_underscores:
  rules: []
";
        let ports = webhook_ports_from_source(rulebook).unwrap();
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![5000, 5001]);
    }

    #[test]
    fn test_ports_deduplicated_across_rulesets() {
        let rulebook = r"
- name: one
  sources:
    - ansible.eda.webhook: {port: 5000}
- name: two
  sources:
    - ansible.eda.webhook: {port: 5000}
";
        let ports = webhook_ports_from_source(rulebook).unwrap();
        assert_eq!(ports.len(), 1);
        assert!(ports.contains(&5000));
    }

    #[test]
    fn test_source_without_port_contributes_nothing() {
        let rulebook = r"
- name: ticks
  sources:
    - ansible.eda.range:
        limit: 5
    - name: port
      filters: {port: 9000}
";
        assert!(webhook_ports_from_source(rulebook).unwrap().is_empty());
    }

    #[test]
    fn test_non_numeric_port_ignored() {
        let rulebook = r#"
- sources:
    - ansible.eda.webhook: {port: "5000"}
"#;
        assert!(webhook_ports_from_source(rulebook).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(webhook_ports_from_source("- [unclosed").is_err());
    }
}
