//! Shared helpers: JSON extraction from engine output, branch slugs, atomic file writes.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::Path;

/// Every top-level JSON object embedded in `text`, in order of appearance.
///
/// Each `{` is tried as the start of a JSON value; string contents are
/// handled by the JSON parser, so braces inside strings do not count. Brace
/// pairs that are not JSON (code snippets in prose) are skipped.
pub fn json_objects(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(serde_json::Value::Object(_))) => {
                let end = start + stream.byte_offset();
                found.push(&text[start..end]);
                pos = end;
            }
            _ => pos = start + 1,
        }
    }
    found
}

/// Lowercase ASCII slug for branch names, at most `max_len` bytes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Write `contents` to `path` through a temp file in the same directory and a
/// rename, so readers see either the old or the new file, never a torn one.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Path has no parent directory: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    temp.write_all(contents)
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temp file for {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Quote `arg` as one word for `sh`. Plain paths and test names pass
/// through unchanged.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Keep the tail of long command output for reports and prompts.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_objects_simple() {
        assert_eq!(json_objects(r#"{"key": "value"}"#), vec![r#"{"key": "value"}"#]);
    }

    #[test]
    fn test_json_objects_skip_prose_and_code() {
        let text = r#"Wrote `fn main() { run(); }` first. {"complexity": "trivial"} done"#;
        assert_eq!(json_objects(text), vec![r#"{"complexity": "trivial"}"#]);
        // An empty pair in a snippet is still an object; callers filter by keys.
        assert_eq!(json_objects("`impl X {}` then {\"a\": 1}"), vec!["{}", r#"{"a": 1}"#]);
    }

    #[test]
    fn test_json_objects_nested_is_one_object() {
        let text = r#"{"outer": {"inner": "value"}} trailing {"b": 1}"#;
        assert_eq!(json_objects(text), vec![r#"{"outer": {"inner": "value"}}"#, r#"{"b": 1}"#]);
    }

    #[test]
    fn test_json_objects_braces_inside_strings() {
        let text = r#"{"summary": "wrote fn f() { }", "n": 1}"#;
        assert_eq!(json_objects(text), vec![text]);
    }

    #[test]
    fn test_json_objects_none_or_unclosed() {
        assert!(json_objects("No JSON here").is_empty());
        assert!(json_objects(r#"{"key": "value""#).is_empty());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix timezone bug!", 40), "fix-timezone-bug");
        assert_eq!(slugify("  --Weird__Name--  ", 40), "weird-name");
        assert_eq!(slugify("a very long task description", 10), "a-very-lon");
        assert_eq!(slugify("abc def ghi", 4), "abc");
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();
        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 2);
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("tests/api.rs"), "tests/api.rs");
        assert_eq!(shell_quote("api::tests::list"), "api::tests::list");
        assert_eq!(shell_quote("an orders handler"), "'an orders handler'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
