//! Solidity version election for the static analyzer: the highest
//! concrete version across all pragmas, with a configurable fallback
//! table for upper-bound-only constraints.

use regex::Regex;

/// Maps an exclusive upper bound `<0.N` to the newest release of the
/// previous minor line.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    fallbacks: Vec<(u32, &'static str)>,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self {
            fallbacks: vec![
                (9, "0.8.26"),
                (8, "0.7.6"),
                (7, "0.6.12"),
                (6, "0.5.17"),
                (5, "0.4.26"),
            ],
        }
    }
}

impl VersionPolicy {
    pub fn with_fallbacks(fallbacks: Vec<(u32, &'static str)>) -> Self {
        Self { fallbacks }
    }

    /// Elects the compiler version for a source. Returns `None` when no
    /// pragma exists.
    pub fn detect(&self, source: &str) -> Option<String> {
        let pragma_re = Regex::new(r"pragma\s+solidity\s+([^;]+);").ok()?;
        let version_re = Regex::new(r"(\d+\.\d+)(?:\.(\d+))?").ok()?;

        let mut versions: Vec<String> = Vec::new();
        for caps in pragma_re.captures_iter(source) {
            let constraint = caps[1].trim();
            if let Some(picked) = self.pick_from_upper_bound(constraint) {
                versions.push(picked);
                continue;
            }
            for v in version_re.captures_iter(constraint) {
                let patch = v.get(2).map(|m| m.as_str()).unwrap_or("0");
                versions.push(format!("{}.{patch}", &v[1]));
            }
        }

        versions.into_iter().max_by(|a, b| compare_versions(a, b))
    }

    /// A constraint led by `<` or `<=` pins the usable version from above:
    /// `<=` takes the bound itself, `<0.N` falls back to the table.
    fn pick_from_upper_bound(&self, constraint: &str) -> Option<String> {
        let upper_re = Regex::new(r"(<=|<)\s*(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
        let caps = upper_re.captures(constraint)?;
        let op = &caps[1];
        let major: u32 = caps[2].parse().ok()?;
        let minor: u32 = caps[3].parse().ok()?;

        if op == "<=" {
            let patch = caps.get(4).map(|m| m.as_str()).unwrap_or("0");
            return Some(format!("{major}.{minor}.{patch}"));
        }
        if major == 0 {
            for (bound, fallback) in &self.fallbacks {
                if minor == *bound {
                    return Some((*fallback).to_string());
                }
            }
        }
        None
    }
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> (u32, u32, u32) {
        let mut parts = v.split('.').map(|p| p.parse().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    };
    parse(a).cmp(&parse(b))
}

/// Well-formed `x.y.z`, padding missing parts; defaults to 0.8.0.
pub fn normalize_solidity_version(version: &str) -> String {
    if version.is_empty() {
        return "0.8.0".to_string();
    }
    let parts: Vec<&str> = version.split('.').collect();
    match parts.len() {
        0 | 1 => "0.8.0".to_string(),
        2 => format!("{version}.0"),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_highest_concrete_version() {
        let policy = VersionPolicy::default();
        let source = "pragma solidity ^0.8.4;\npragma solidity 0.8.19;";
        assert_eq!(policy.detect(source).unwrap(), "0.8.19");
    }

    #[test]
    fn test_two_part_versions_are_padded() {
        let policy = VersionPolicy::default();
        assert_eq!(policy.detect("pragma solidity ^0.8;").unwrap(), "0.8.0");
    }

    #[test]
    fn test_upper_bound_fallback_table() {
        let policy = VersionPolicy::default();
        assert_eq!(policy.detect("pragma solidity <0.8.0;").unwrap(), "0.7.6");
        assert_eq!(policy.detect("pragma solidity <0.7.0;").unwrap(), "0.6.12");
        assert_eq!(policy.detect("pragma solidity <0.6.0;").unwrap(), "0.5.17");
        assert_eq!(policy.detect("pragma solidity <0.5.0;").unwrap(), "0.4.26");
        assert_eq!(policy.detect("pragma solidity <0.9.0;").unwrap(), "0.8.26");
    }

    #[test]
    fn test_inclusive_upper_bound_takes_the_bound() {
        let policy = VersionPolicy::default();
        assert_eq!(policy.detect("pragma solidity <=0.7.6;").unwrap(), "0.7.6");
        assert_eq!(policy.detect("pragma solidity <=0.7;").unwrap(), "0.7.0");
    }

    #[test]
    fn test_no_pragma_yields_none() {
        assert!(VersionPolicy::default().detect("contract A {}").is_none());
    }

    #[test]
    fn test_normalize_solidity_version() {
        assert_eq!(normalize_solidity_version(""), "0.8.0");
        assert_eq!(normalize_solidity_version("0.8"), "0.8.0");
        assert_eq!(normalize_solidity_version("0.8.19"), "0.8.19");
    }

    #[test]
    fn test_custom_fallback_table() {
        let policy = VersionPolicy::with_fallbacks(vec![(8, "0.7.0")]);
        assert_eq!(policy.detect("pragma solidity <0.8.0;").unwrap(), "0.7.0");
        assert!(policy.detect("pragma solidity <0.5.0;").is_none());
    }
}
