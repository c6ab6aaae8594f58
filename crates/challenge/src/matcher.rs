//! Best-match selection of a managed challenge for an identifier.
//!
//! Precedence, highest first:
//!
//! 1. exact pattern equal to the identifier
//! 2. explicit wildcard `*.<identifier>`
//! 3. longest wildcard pattern covering the identifier
//! 4. longest pattern the identifier ends with
//! 5. first catch-all configuration (empty `domain_match`)
//!
//! Step 4 is a plain string suffix test on the identifier, so a pattern
//! `ample.com` matches the identifier `example.com`. The test is never run
//! the other way round: a pattern that merely ends with the identifier, such
//! as `www.example.com` for `example.com`, does not match.

use tracing::trace;

use crate::config::ManagedChallengeConfig;

/// Pattern table built from a configuration collection.
///
/// Keys keep first-writer-wins semantics and the order in which they were
/// first seen; the index points back into the source slice.
struct PatternTable {
    entries: Vec<(String, usize)>,
}

impl PatternTable {
    fn build(configs: &[ManagedChallengeConfig]) -> Self {
        let mut entries: Vec<(String, usize)> = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            for pattern in config.patterns() {
                if !entries.iter().any(|(existing, _)| *existing == pattern) {
                    entries.push((pattern, index));
                }
            }
        }
        Self { entries }
    }

    fn get(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern == key)
            .map(|(_, index)| *index)
    }

    /// Keys ordered by descending length. The sort is stable, so equal
    /// lengths keep first-seen order.
    fn by_length_desc(&self) -> Vec<&(String, usize)> {
        let mut ordered: Vec<&(String, usize)> = self.entries.iter().collect();
        ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        ordered
    }
}

/// Left-most label wildcard test: `*.example.com` covers `a.example.com`
/// and `a.b.example.com`, but not `example.com`.
pub fn wildcard_matches(pattern: &str, identifier: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    match identifier.strip_suffix(suffix) {
        Some(prefix) => prefix.len() > 1 && prefix.ends_with('.'),
        None => false,
    }
}

/// Select the single best configuration for `identifier`.
pub fn find_best_match<'a>(
    identifier: &str,
    configs: &'a [ManagedChallengeConfig],
) -> Option<&'a ManagedChallengeConfig> {
    let identifier = identifier.trim().to_lowercase();

    if !identifier.is_empty() {
        let table = PatternTable::build(configs);

        if let Some(index) = table.get(&identifier) {
            trace!(identifier = %identifier, config_id = %configs[index].id, "Exact challenge match");
            return Some(&configs[index]);
        }

        if let Some(index) = table.get(&format!("*.{}", identifier)) {
            trace!(identifier = %identifier, config_id = %configs[index].id, "Explicit wildcard challenge match");
            return Some(&configs[index]);
        }

        let ordered = table.by_length_desc();

        if let Some((pattern, index)) = ordered
            .iter()
            .find(|(pattern, _)| pattern.starts_with("*.") && wildcard_matches(pattern, &identifier))
        {
            trace!(identifier = %identifier, pattern = %pattern, "Wildcard challenge match");
            return Some(&configs[*index]);
        }

        if let Some((pattern, index)) = ordered
            .iter()
            .find(|(pattern, _)| identifier.ends_with(pattern.as_str()))
        {
            trace!(identifier = %identifier, pattern = %pattern, "Suffix challenge match");
            return Some(&configs[*index]);
        }
    }

    let catch_all = configs.iter().find(|c| c.is_catch_all());
    if let Some(config) = catch_all {
        trace!(identifier = %identifier, config_id = %config.id, "Catch-all challenge match");
    }
    catch_all
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn configs(patterns: &[(&str, &str)]) -> Vec<ManagedChallengeConfig> {
        patterns
            .iter()
            .map(|(id, domain_match)| ManagedChallengeConfig::new(*id, *domain_match))
            .collect()
    }

    fn matched<'a>(identifier: &str, configs: &'a [ManagedChallengeConfig]) -> Option<&'a str> {
        find_best_match(identifier, configs).map(|c| c.id.as_str())
    }

    fn reference_set() -> Vec<ManagedChallengeConfig> {
        configs(&[
            ("catch-all", ""),
            ("wild", "*.example.com"),
            ("sub", "sub.example.com"),
            ("apex", "example.com"),
        ])
    }

    #[test]
    fn test_reference_precedence() {
        let set = reference_set();
        assert_eq!(matched("sub.example.com", &set), Some("sub"));
        assert_eq!(matched("foo.example.com", &set), Some("wild"));
        assert_eq!(matched("example.com", &set), Some("apex"));
        assert_eq!(matched("other.com", &set), Some("catch-all"));
    }

    #[test]
    fn test_no_match_without_catch_all() {
        let set = configs(&[("wild", "*.example.com"), ("apex", "example.com")]);
        assert_eq!(matched("other.org", &set), None);
    }

    #[test]
    fn test_identifier_is_case_insensitive() {
        let set = reference_set();
        assert_eq!(matched("SUB.Example.COM", &set), Some("sub"));
    }

    #[test]
    fn test_explicit_wildcard_for_identifier() {
        let set = configs(&[("wild-sub", "*.sub.example.com"), ("wild", "*.example.com")]);
        // No exact key for sub.example.com, but "*.sub.example.com" is present.
        assert_eq!(matched("sub.example.com", &set), Some("wild-sub"));
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let set = configs(&[("short", "*.example.com"), ("long", "*.dev.example.com")]);
        assert_eq!(matched("api.dev.example.com", &set), Some("long"));
        assert_eq!(matched("api.example.com", &set), Some("short"));
    }

    #[test]
    fn test_wildcard_covers_deeper_labels() {
        let set = configs(&[("wild", "*.example.com")]);
        assert_eq!(matched("a.b.example.com", &set), Some("wild"));
    }

    #[test]
    fn test_longest_suffix_wins() {
        let set = configs(&[("apex", "example.com"), ("sub", "sub.example.com")]);
        assert_eq!(matched("www.sub.example.com", &set), Some("sub"));
        assert_eq!(matched("www.example.com", &set), Some("apex"));
    }

    #[test]
    fn test_suffix_match_ignores_label_boundary() {
        let set = configs(&[("apex", "ample.com")]);
        assert_eq!(matched("example.com", &set), Some("apex"));
    }

    #[test]
    fn test_longer_pattern_does_not_cover_shorter_identifier() {
        let set = configs(&[("www", "www.example.com")]);
        assert_eq!(matched("example.com", &set), None);
    }

    #[test]
    fn test_first_writer_wins_on_duplicate_pattern() {
        let set = configs(&[("first", "example.com"), ("second", "example.com;other.com")]);
        assert_eq!(matched("example.com", &set), Some("first"));
        assert_eq!(matched("other.com", &set), Some("second"));
    }

    #[test]
    fn test_first_catch_all_in_collection_order() {
        let set = configs(&[("a", "x.com"), ("blank", " "), ("first", ""), ("second", "")]);
        assert_eq!(matched("nothing.net", &set), Some("first"));
    }

    #[test]
    fn test_blank_domain_match_is_not_catch_all() {
        let set = configs(&[("a", "x.com"), ("blank", " ; ")]);
        assert_eq!(matched("nothing.net", &set), None);
        assert_eq!(matched("x.com", &set), Some("a"));
    }

    #[test]
    fn test_empty_identifier_falls_back_to_catch_all() {
        let set = reference_set();
        assert_eq!(matched("", &set), Some("catch-all"));
    }

    #[test]
    fn test_wildcard_matches() {
        assert!(wildcard_matches("*.example.com", "a.example.com"));
        assert!(wildcard_matches("*.example.com", "a.b.example.com"));
        assert!(!wildcard_matches("*.example.com", "example.com"));
        assert!(!wildcard_matches("*.example.com", "badexample.com"));
        assert!(!wildcard_matches("*.example.com", ".example.com"));
        assert!(!wildcard_matches("example.com", "a.example.com"));
    }

    fn label() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    fn domain() -> impl Strategy<Value = String> {
        prop::collection::vec(label(), 1..4).prop_map(|labels| labels.join("."))
    }

    proptest! {
        #[test]
        fn prop_comma_and_semicolon_are_equivalent(
            groups in prop::collection::vec(prop::collection::vec(domain(), 0..4), 1..5),
            identifier in domain(),
        ) {
            let semi: Vec<_> = groups.iter().enumerate()
                .map(|(i, g)| ManagedChallengeConfig::new(i.to_string(), g.join(";")))
                .collect();
            let comma: Vec<_> = groups.iter().enumerate()
                .map(|(i, g)| ManagedChallengeConfig::new(i.to_string(), g.join(",")))
                .collect();

            let by_semi = find_best_match(&identifier, &semi).map(|c| c.id.clone());
            let by_comma = find_best_match(&identifier, &comma).map(|c| c.id.clone());
            prop_assert_eq!(by_semi, by_comma);
        }

        #[test]
        fn prop_matching_is_deterministic(
            groups in prop::collection::vec(prop::collection::vec(domain(), 0..3), 1..6),
            identifier in domain(),
        ) {
            let set: Vec<_> = groups.iter().enumerate()
                .map(|(i, g)| ManagedChallengeConfig::new(i.to_string(), g.join(";")))
                .collect();
            let fresh = set.clone();

            let first = find_best_match(&identifier, &set).map(|c| c.id.clone());
            let second = find_best_match(&identifier, &fresh).map(|c| c.id.clone());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_exact_pattern_always_wins(
            name in domain(),
            others in prop::collection::vec(domain(), 0..5),
        ) {
            let mut set: Vec<_> = others.iter().enumerate()
                .filter(|(_, d)| **d != name)
                .map(|(i, d)| ManagedChallengeConfig::new(format!("o{}", i), format!("*.{}", d)))
                .collect();
            set.push(ManagedChallengeConfig::new("exact", name.clone()));

            prop_assert_eq!(find_best_match(&name, &set).map(|c| c.id.as_str()), Some("exact"));
        }
    }
}
