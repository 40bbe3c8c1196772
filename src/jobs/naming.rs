//! Channel-name resolution and filesystem-safe naming.

const FALLBACK_CHANNEL: &str = "unknown_channel";

/// Pick the channel folder name from metadata candidates.
///
/// Candidates are tried in order; the first one that is present and
/// non-blank wins. With no usable candidate the fixed fallback is
/// returned. The winner is sanitized before use.
pub fn resolve_channel_name<'a, I>(candidates: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|c| !c.is_empty())
        .map(sanitize_name)
        .unwrap_or_else(|| FALLBACK_CHANNEL.to_string())
}

/// Strip characters that are unsafe in file and folder names.
///
/// Keeps a leading `@` (channel handles) and interior spaces; removes
/// path separators, shell-hostile punctuation and control characters,
/// then trims the result.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_nonblank_candidate_wins() {
        let name = resolve_channel_name([None, Some("  "), Some("Cool Beats"), Some("Later")]);
        assert_eq!(name, "Cool Beats");
    }

    #[test]
    fn test_all_blank_falls_back() {
        assert_eq!(resolve_channel_name([None, Some(""), Some("   ")]), "unknown_channel");
        assert_eq!(resolve_channel_name([]), "unknown_channel");
    }

    #[test]
    fn test_sanitize_strips_path_characters() {
        assert_eq!(sanitize_name("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
    }

    #[test]
    fn test_sanitize_preserves_leading_at() {
        assert_eq!(sanitize_name("@SomeChannel"), "@SomeChannel");
    }

    #[test]
    fn test_sanitize_trims_whitespace() {
        assert_eq!(sanitize_name("  My Channel  "), "My Channel");
    }

    #[test]
    fn test_resolver_sanitizes_winner() {
        let name = resolve_channel_name([Some("Bad/Name?")]);
        assert_eq!(name, "BadName");
    }
}
