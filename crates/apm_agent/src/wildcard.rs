//! Case-insensitive wildcard patterns for ignore lists.
//!
//! `*` matches any run of characters (including none). Everything else is
//! literal. `/exit*` matches `/exit` and `/exit/now`, `*.png` matches any
//! path ending in `.png`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardMatcher {
    pattern: String,
    segments: Vec<String>,
}

impl WildcardMatcher {
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.trim().to_lowercase();
        let segments = pattern.split('*').map(str::to_string).collect();
        Self { pattern, segments }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        let (first, rest) = match self.segments.split_first() {
            Some(split) => split,
            None => return text.is_empty(),
        };
        let Some((last, middle)) = rest.split_last() else {
            return text == *first;
        };

        if !text.starts_with(first.as_str()) {
            return false;
        }
        let mut pos = first.len();
        for segment in middle {
            match text[pos..].find(segment.as_str()) {
                Some(found) => pos += found + segment.len(),
                None => return false,
            }
        }
        text[pos..].ends_with(last.as_str())
    }
}

/// True if any matcher accepts `text`.
pub fn any_matches(matchers: &[WildcardMatcher], text: &str) -> bool {
    matchers.iter().any(|m| m.matches(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern() {
        let m = WildcardMatcher::new("/exit");
        assert!(m.matches("/exit"));
        assert!(m.matches("/EXIT"));
        assert!(!m.matches("/exit/now"));
    }

    #[test]
    fn test_prefix_suffix_and_infix() {
        assert!(WildcardMatcher::new("/exit*").matches("/exit/now"));
        assert!(WildcardMatcher::new("*.png").matches("/static/logo.PNG"));
        assert!(!WildcardMatcher::new("*.png").matches("/static/logo.jpg"));
        assert!(WildcardMatcher::new("/api/*/health").matches("/api/v1/health"));
        assert!(!WildcardMatcher::new("/api/*/health").matches("/api/v1/ready"));
        assert!(WildcardMatcher::new("*").matches(""));
    }

    #[test]
    fn test_segments_do_not_overlap() {
        // "ab*ba" must not match "aba": the two literals would need to share the "b"
        assert!(!WildcardMatcher::new("ab*ba").matches("aba"));
        assert!(WildcardMatcher::new("ab*ba").matches("abba"));
    }
}
