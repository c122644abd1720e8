use std::{
    path::{Component, Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use time::OffsetDateTime;

/// Whether `name` can be used as a single path component and embedded unquoted
/// in YAML and shell command lines.
pub fn is_path_safe(name: &str) -> bool {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex =
        REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").unwrap());
    regex.is_match(name) && !name.contains("..")
}

/// Replace anything that is not path-safe with `-`, for use in file names.
pub fn sanitize_component(value: &str) -> String {
    let out: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') { c } else { '-' })
        .collect();
    let out = out.trim_matches('-');
    if out.is_empty() { "_".to_string() } else { out.to_string() }
}

/// Join two paths, only including the normal components.
pub fn join_normalized(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let mut out = base.as_ref().to_path_buf();
    out.extend(path.as_ref().components().filter(|v| matches!(v, Component::Normal(_))));
    out
}

pub fn now() -> OffsetDateTime { OffsetDateTime::now_utc() }

/// Truncate `text` to at most `max` bytes on a char boundary, noting how much was dropped.
pub fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... ({} bytes truncated)", &text[..end], text.len() - end)
}
