//! Front-matter blocks embedded in issue bodies.
//!
//! A block is the text between the first two lines consisting solely of `---`.
//! Its contents are read by a list of parsers tried in order: a strict YAML
//! parser, then a line-oriented parser that only understands
//! `key:` followed by `- item` lines.

use serde_yaml::Value;

pub const DELIMITER: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrontMatterError {
    #[error("{parser}: syntax error: {message}")]
    Syntax { parser: &'static str, message: String },
    #[error("{parser}: key {key:?} not found")]
    MissingKey { parser: &'static str, key: String },
    #[error("{parser}: key {key:?} is not a list")]
    NotASequence { parser: &'static str, key: String },
    #[error("{parser}: item {index} is not a non-empty string")]
    InvalidItem { parser: &'static str, index: usize },
}

pub trait FrontMatterParser {
    fn name(&self) -> &'static str;

    /// Read the list stored under `key`. An empty list is not an error here.
    fn parse_list(&self, block: &str, key: &str) -> Result<Vec<String>, FrontMatterError>;
}

/// Return the text between the first and second delimiter lines.
pub fn extract_block(body: &str) -> Option<String> {
    let mut lines = body.lines();
    lines.by_ref().find(|line| line.trim_end() == DELIMITER)?;
    let mut block = Vec::new();
    for line in lines {
        if line.trim_end() == DELIMITER {
            return Some(block.join("\n"));
        }
        block.push(line);
    }
    None
}

/// Parsers in the order they are tried.
pub fn default_parsers() -> [&'static dyn FrontMatterParser; 2] { [&YamlParser, &LineParser] }

/// Try each parser in turn; the first success wins, otherwise the last error is returned.
pub fn parse_list(
    block: &str,
    key: &str,
    parsers: &[&dyn FrontMatterParser],
) -> Result<Vec<String>, FrontMatterError> {
    let mut last_error = None;
    for parser in parsers {
        match parser.parse_list(block, key) {
            Ok(items) => return Ok(items),
            Err(e) => {
                tracing::debug!("Front-matter parser failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(FrontMatterError::Syntax {
        parser: "none",
        message: "no parsers configured".to_string(),
    }))
}

pub struct YamlParser;

impl FrontMatterParser for YamlParser {
    fn name(&self) -> &'static str { "yaml" }

    fn parse_list(&self, block: &str, key: &str) -> Result<Vec<String>, FrontMatterError> {
        let parser = self.name();
        let value: Value = serde_yaml::from_str(block)
            .map_err(|e| FrontMatterError::Syntax { parser, message: e.to_string() })?;
        let Some(entry) = value.as_mapping().and_then(|m| m.get(key)) else {
            return Err(FrontMatterError::MissingKey { parser, key: key.to_string() });
        };
        let items = match entry {
            Value::Sequence(items) => items,
            Value::Null => return Ok(Vec::new()),
            _ => return Err(FrontMatterError::NotASequence { parser, key: key.to_string() }),
        };
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let name = match item {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => String::new(),
                };
                if name.is_empty() {
                    Err(FrontMatterError::InvalidItem { parser, index })
                } else {
                    Ok(name)
                }
            })
            .collect()
    }
}

pub struct LineParser;

impl FrontMatterParser for LineParser {
    fn name(&self) -> &'static str { "line" }

    fn parse_list(&self, block: &str, key: &str) -> Result<Vec<String>, FrontMatterError> {
        let parser = self.name();
        let prefix = format!("{key}:");
        let mut found = false;
        let mut items = Vec::new();
        for line in block.lines() {
            let trimmed = line.trim();
            if !found {
                if let Some(rest) = line.strip_prefix(&prefix) {
                    let rest = strip_comment(rest).trim();
                    if !rest.is_empty() {
                        return parse_inline(rest, parser, key);
                    }
                    found = true;
                }
                continue;
            }
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(item) = trimmed.strip_prefix('-') else {
                if line.starts_with(char::is_whitespace) {
                    return Err(FrontMatterError::Syntax {
                        parser,
                        message: format!("unexpected line {trimmed:?}"),
                    });
                }
                // Next top-level key ends the list
                break;
            };
            let item = unquote(strip_comment(item).trim());
            if item.is_empty() {
                return Err(FrontMatterError::InvalidItem { parser, index: items.len() });
            }
            items.push(item.to_string());
        }
        if !found {
            return Err(FrontMatterError::MissingKey { parser, key: key.to_string() });
        }
        Ok(items)
    }
}

/// `key: [a, b]`
fn parse_inline(
    rest: &str,
    parser: &'static str,
    key: &str,
) -> Result<Vec<String>, FrontMatterError> {
    let Some(inner) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) else {
        return Err(FrontMatterError::NotASequence { parser, key: key.to_string() });
    };
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .enumerate()
        .map(|(index, item)| {
            let item = unquote(item.trim());
            if item.is_empty() {
                Err(FrontMatterError::InvalidItem { parser, index })
            } else {
                Ok(item.to_string())
            }
        })
        .collect()
}

fn strip_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(idx) => &value[..idx],
        None => value,
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner.trim();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_block() {
        let body = "Please document these.\n---\nintegrations:\n  - foo\n---\ntrailing text\n---\n";
        assert_eq!(extract_block(body).as_deref(), Some("integrations:\n  - foo"));
        assert_eq!(extract_block("---\r\na: 1\r\n---  \r\n").as_deref(), Some("a: 1"));
        assert_eq!(extract_block("no block here"), None);
        assert_eq!(extract_block("---\nintegrations:\n  - foo\n"), None);
        // Indented or longer rules are not delimiters
        assert_eq!(extract_block("  ---\na\n----\n"), None);
        assert_eq!(extract_block("---\n---\n").as_deref(), Some(""));
    }

    #[test]
    fn test_yaml_parser() {
        let block = "title: Docs\nintegrations:\n  - foo\n  - \"bar\"\n  - 42\n";
        assert_eq!(YamlParser.parse_list(block, "integrations").unwrap(), vec!["foo", "bar", "42"]);
        assert_eq!(YamlParser.parse_list("integrations: [a, b]", "integrations").unwrap(), vec![
            "a", "b"
        ]);
        assert_eq!(YamlParser.parse_list("integrations:", "integrations").unwrap(), Vec::<String>::new());
        assert!(matches!(
            YamlParser.parse_list("other: [a]", "integrations"),
            Err(FrontMatterError::MissingKey { .. })
        ));
        assert!(matches!(
            YamlParser.parse_list("integrations: foo", "integrations"),
            Err(FrontMatterError::NotASequence { .. })
        ));
        assert!(matches!(
            YamlParser.parse_list("integrations:\n  - {a: 1}", "integrations"),
            Err(FrontMatterError::InvalidItem { index: 0, .. })
        ));
        assert!(matches!(
            YamlParser.parse_list("integrations: [a\n", "integrations"),
            Err(FrontMatterError::Syntax { .. })
        ));
    }

    #[test]
    fn test_line_parser() {
        let block = "integrations:\n  - foo  # first\n\n  - 'bar'\n- baz\nowner: me\n  - ignored\n";
        assert_eq!(LineParser.parse_list(block, "integrations").unwrap(), vec!["foo", "bar", "baz"]);
        assert_eq!(LineParser.parse_list("integrations: [a, 'b']", "integrations").unwrap(), vec![
            "a", "b"
        ]);
        assert!(matches!(
            LineParser.parse_list("title: x", "integrations"),
            Err(FrontMatterError::MissingKey { .. })
        ));
        assert!(matches!(
            LineParser.parse_list("integrations:\n  -\n", "integrations"),
            Err(FrontMatterError::InvalidItem { index: 0, .. })
        ));
    }

    #[test]
    fn test_fallback_order() {
        // Tab indentation is rejected by YAML but understood line by line
        let block = "integrations:\n\t- foo\n\t- bar\n";
        assert!(YamlParser.parse_list(block, "integrations").is_err());
        assert_eq!(parse_list(block, "integrations", &default_parsers()).unwrap(), vec![
            "foo", "bar"
        ]);

        // When both fail the last parser's error is reported
        let err = parse_list("nothing: here", "integrations", &default_parsers()).unwrap_err();
        assert_eq!(err, FrontMatterError::MissingKey {
            parser: "line",
            key: "integrations".to_string()
        });
    }
}
