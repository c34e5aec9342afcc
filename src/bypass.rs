use crate::patterns::{normalise_bypass_list, BypassPattern};
use log::warn;

/// Compiled bypass rules for one settings snapshot.
#[derive(Debug, Clone, Default)]
pub struct BypassMatcher {
    patterns: Vec<BypassPattern>,
}

impl BypassMatcher {
    /// Normalises and compiles a list of raw patterns. Patterns that fail to
    /// compile are logged and left out; the rest keep their order.
    pub fn new<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = normalise_bypass_list(raw)
            .iter()
            .filter_map(|pattern| match BypassPattern::compile(pattern) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("[path-proxy] Invalid bypass pattern skipped: {}", e);
                    None
                }
            })
            .collect();

        Self { patterns }
    }

    pub fn patterns(&self) -> &[BypassPattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Decides whether `url` should go out directly instead of through the proxy.
    ///
    /// A URL that already starts with `proxy_base` always bypasses, which keeps
    /// rewriting idempotent.
    pub fn should_bypass(&self, url: &str, proxy_base: Option<&str>) -> bool {
        if url.is_empty() {
            return false;
        }

        if let Some(base) = proxy_base {
            if !base.is_empty() && url.starts_with(base) {
                return true;
            }
        }

        if self.patterns.is_empty() {
            return false;
        }

        for pattern in &self.patterns {
            match pattern.matches(url) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "[path-proxy] Error while evaluating bypass pattern '{}': {}",
                        pattern.as_str(),
                        e
                    );
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_base_prefix_always_bypasses() {
        let matcher = BypassMatcher::default();
        let base = "https://proxy.local/";
        assert!(matcher.should_bypass("https://proxy.local/https://api.example.com/", Some(base)));
        assert!(!matcher.should_bypass("https://api.example.com/", Some(base)));
        assert!(!matcher.should_bypass("https://api.example.com/", None));
    }

    #[test]
    fn test_empty_list_never_bypasses() {
        let matcher = BypassMatcher::new(Vec::<String>::new());
        assert!(matcher.is_empty());
        assert!(!matcher.should_bypass("https://example.com/", Some("http://proxy/")));
    }

    #[test]
    fn test_invalid_patterns_are_skipped() {
        let matcher = BypassMatcher::new(["/(broken/", "service.example.com"]);
        assert_eq!(matcher.patterns().len(), 1);
        assert!(matcher.should_bypass("https://service.example.com/api", None));
    }

    #[test]
    fn test_evaluation_error_does_not_stop_later_patterns() {
        let matcher = BypassMatcher::new(["example.com", "relative"]);
        // host patterns cannot parse a relative URL, the substring pattern still runs
        let matcher_with_path = BypassMatcher::new(["example.com", "relative/"]);
        assert!(!matcher.should_bypass("relative/path", None));
        assert!(matcher_with_path.should_bypass("relative/path", None));
    }

    #[test]
    fn test_first_match_wins_in_order() {
        let matcher = BypassMatcher::new(["nothing.test", "*.example.com", "example.com"]);
        assert!(matcher.should_bypass("https://a.example.com/", None));
        assert!(!matcher.should_bypass("https://other.test/", None));
    }
}
