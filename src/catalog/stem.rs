//! Stem-file typing from separator output filenames.

use serde::{Deserialize, Serialize};

/// The stem categories a separated track decomposes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StemType {
    Vocals,
    Drums,
    Bass,
    /// Anything melodic-residual: the separator's `Other` and
    /// `Instrumental` outputs.
    Sample,
}

impl StemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StemType::Vocals => "Vocals",
            StemType::Drums => "Drums",
            StemType::Bass => "Bass",
            StemType::Sample => "Sample",
        }
    }
}

/// Result of classifying one output filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StemMatch {
    Known(StemType),
    /// Suffix tag (or whole stem name when no tag is present) that the
    /// table does not cover. Listings skip these.
    Unrecognized(String),
}

impl StemMatch {
    pub fn known(&self) -> Option<StemType> {
        match self {
            StemMatch::Known(t) => Some(*t),
            StemMatch::Unrecognized(_) => None,
        }
    }
}

/// Classify a separator output filename by its trailing `_(Tag)` marker.
///
/// The extension is ignored. `track_(Vocals).mp3` is Vocals,
/// `track_(Other).mp3` is Sample, `track_(Piano).mp3` is
/// `Unrecognized("Piano")`, and a file with no marker at all is
/// `Unrecognized` with its whole stem name.
pub fn classify(file_name: &str) -> StemMatch {
    let stem = file_name
        .rsplit_once('.')
        .map(|(base, _ext)| base)
        .unwrap_or(file_name);

    let tag = stem.rfind("_(").and_then(|idx| {
        let rest = &stem[idx + 2..];
        rest.strip_suffix(')')
    });

    match tag {
        Some("Vocals") => StemMatch::Known(StemType::Vocals),
        Some("Drums") => StemMatch::Known(StemType::Drums),
        Some("Bass") => StemMatch::Known(StemType::Bass),
        Some("Other") | Some("Instrumental") => StemMatch::Known(StemType::Sample),
        Some(other) => StemMatch::Unrecognized(other.to_string()),
        None => StemMatch::Unrecognized(stem.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_suffixes() {
        assert_eq!(
            classify("My Beat_(Vocals).mp3"),
            StemMatch::Known(StemType::Vocals)
        );
        assert_eq!(
            classify("My Beat_(Drums).mp3"),
            StemMatch::Known(StemType::Drums)
        );
        assert_eq!(
            classify("My Beat_(Bass).mp3"),
            StemMatch::Known(StemType::Bass)
        );
        assert_eq!(
            classify("My Beat_(Other).mp3"),
            StemMatch::Known(StemType::Sample)
        );
        assert_eq!(
            classify("My Beat_(Instrumental).mp3"),
            StemMatch::Known(StemType::Sample)
        );
    }

    #[test]
    fn test_classify_unrecognized_suffix() {
        assert_eq!(
            classify("My Beat_(Piano).mp3"),
            StemMatch::Unrecognized("Piano".to_string())
        );
    }

    #[test]
    fn test_classify_without_marker() {
        assert_eq!(
            classify("plain_file.mp3"),
            StemMatch::Unrecognized("plain_file".to_string())
        );
    }

    #[test]
    fn test_classify_uses_last_marker() {
        // A title that itself contains a parenthesized chunk.
        assert_eq!(
            classify("Song_(Remix)_(Vocals).mp3"),
            StemMatch::Known(StemType::Vocals)
        );
    }

    #[test]
    fn test_stem_type_serializes_pascal_case() {
        assert_eq!(
            serde_json::to_string(&StemType::Sample).unwrap(),
            r#""Sample""#
        );
        assert_eq!(StemType::Vocals.as_str(), "Vocals");
    }
}
