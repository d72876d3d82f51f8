use regex::Regex;
use std::sync::LazyLock;

/// Label used when sanitization leaves nothing behind.
pub const DEFAULT_LABEL: &str = "ISOFORGE";

/// Maximum volume label length.
pub const MAX_LABEL_LEN: usize = 32;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());

/// Turn arbitrary text into a volume label.
///
/// Whitespace runs collapse to a single `_`, every other character outside
/// `[A-Za-z0-9_]` becomes `_`, the result is cut to [`MAX_LABEL_LEN`],
/// trailing underscores are trimmed and the whole thing is upper-cased.
pub fn sanitize_label(input: &str) -> String {
    let collapsed = WHITESPACE.replace_all(input.trim(), "_");
    let replaced = NON_WORD.replace_all(&collapsed, "_");

    // Only ASCII remains, so byte truncation is safe
    let truncated = &replaced[..replaced.len().min(MAX_LABEL_LEN)];
    let trimmed = truncated.trim_end_matches('_');

    if trimmed.trim_start_matches('_').is_empty() {
        return DEFAULT_LABEL.to_string();
    }

    trimmed.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_spaces_and_punctuation() {
        assert_eq!(sanitize_label("My Windows 11!!"), "MY_WINDOWS_11");
    }

    #[test]
    fn test_sanitize_collapses_whitespace_runs() {
        assert_eq!(sanitize_label("data   \t disk"), "DATA_DISK");
    }

    #[test]
    fn test_sanitize_only_invalid_characters() {
        assert_eq!(sanitize_label("!!!@@@"), DEFAULT_LABEL);
        assert_eq!(sanitize_label(""), DEFAULT_LABEL);
        assert_eq!(sanitize_label("   "), DEFAULT_LABEL);
    }

    #[test]
    fn test_sanitize_truncates_to_max_length() {
        let label = sanitize_label(&"a".repeat(50));
        assert_eq!(label.len(), MAX_LABEL_LEN);
        assert_eq!(label, "A".repeat(MAX_LABEL_LEN));
    }

    #[test]
    fn test_sanitize_trims_after_truncation() {
        let input = format!("{}   tail", "x".repeat(31));
        assert_eq!(sanitize_label(&input), "X".repeat(31));
    }

    #[test]
    fn test_sanitize_non_ascii() {
        assert_eq!(sanitize_label("Café Disc"), "CAF__DISC");
    }
}
