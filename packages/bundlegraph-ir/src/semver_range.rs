//! Semver range handling for package-version resolution
//!
//! npm allows non-semver strings on the right hand side of a dependency
//! (URLs, tags, branches). Those never parse as ranges here and only ever
//! satisfy their own pinned version.

use semver::{Comparator, Op, Version, VersionReq};

use crate::errors::{IrError, Result};

/// Parse a consumption range, returning `None` for non-semver specifiers.
pub fn parse_range(range: &str) -> Option<VersionReq> {
    VersionReq::parse(range).ok()
}

pub fn is_valid_range(range: &str) -> bool {
    parse_range(range).is_some()
}

/// Lenient version parse: tolerates a leading `v`/`=` and missing minor or
/// patch components, the way npm coerces catalog versions.
pub fn coerce_version(version: &str) -> Option<Version> {
    let trimmed = version.trim().trim_start_matches(['v', '=']);
    if let Ok(parsed) = Version::parse(trimmed) {
        return Some(parsed);
    }
    let main = trimmed
        .split(['-', '+'])
        .next()
        .unwrap_or(trimmed);
    let mut parts = main.split('.');
    let major: u64 = parts.next()?.parse().ok()?;
    let minor: u64 = parts.next().map(|p| p.parse().ok()).unwrap_or(Some(0))?;
    let patch: u64 = parts.next().map(|p| p.parse().ok()).unwrap_or(Some(0))?;
    Some(Version::new(major, minor, patch))
}

/// Does `version` satisfy `range`? Non-semver ranges satisfy nothing.
pub fn range_satisfies(range: &str, version: &Version) -> bool {
    match parse_range(range) {
        Some(req) => req.matches(version),
        None => false,
    }
}

/// Intersect a group of semver ranges into a single range string.
///
/// Caret comparators of the same major (or same major.minor for `^0.x`) fold
/// to the highest lower bound; everything else is combined conjunctively.
/// The caller guarantees the group has a common satisfying version, so
/// structurally disjoint carets are a resolution error.
pub fn intersect_ranges(ranges: &[&str]) -> Result<String> {
    if ranges.is_empty() {
        return Err(IrError::bug("cannot intersect an empty set of ranges"));
    }
    let mut carets: Vec<Comparator> = Vec::new();
    let mut rest: Vec<Comparator> = Vec::new();
    for range in ranges {
        let req = parse_range(range).ok_or_else(|| {
            IrError::resolution(format!(
                "'{}' is not a semver range and cannot be intersected",
                range
            ))
        })?;
        for comparator in req.comparators {
            if comparator.op == Op::Caret {
                carets.push(comparator);
            } else if !rest.contains(&comparator) {
                rest.push(comparator);
            }
        }
    }

    let mut folded: Vec<Comparator> = Vec::new();
    for caret in carets {
        // ^0.x carets only overlap within the same minor; others within the
        // same major. Two distinct caret groups never intersect.
        let slot = folded.iter().position(|existing| {
            existing.major == caret.major && (caret.major != 0 || existing.minor == caret.minor)
        });
        match slot {
            Some(idx) => {
                if caret_bound(&caret) > caret_bound(&folded[idx]) {
                    folded[idx] = caret;
                }
            }
            None if folded.is_empty() => folded.push(caret),
            None => {
                return Err(IrError::resolution(format!(
                    "ranges {:?} do not intersect",
                    ranges
                )));
            }
        }
    }

    let mut comparators = folded;
    comparators.extend(rest);
    let req = VersionReq { comparators };
    Ok(req.to_string())
}

fn caret_bound(comparator: &Comparator) -> (u64, u64, u64) {
    (
        comparator.major,
        comparator.minor.unwrap_or(0),
        comparator.patch.unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caret_intersection_takes_higher_bound() {
        assert_eq!(intersect_ranges(&["^1.0.0", "^1.2.0"]).unwrap(), "^1.2.0");
        assert_eq!(
            intersect_ranges(&["^1.2.0", "^1.0.0", "^1.1.4"]).unwrap(),
            "^1.2.0"
        );
    }

    #[test]
    fn test_single_range_is_identity() {
        assert_eq!(intersect_ranges(&["^2.0.0"]).unwrap(), "^2.0.0");
    }

    #[test]
    fn test_non_semver_range_refuses_to_intersect() {
        let err = intersect_ranges(&["git+https://example.com/repo.git", "^1.0.0"]).unwrap_err();
        assert!(err.to_string().contains("not a semver range"));
    }

    #[test]
    fn test_coerce_pads_missing_components() {
        assert_eq!(coerce_version("4.17").unwrap(), Version::new(4, 17, 0));
        assert_eq!(coerce_version("v2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(
            coerce_version("1.2.3-beta.1").unwrap(),
            Version::parse("1.2.3-beta.1").unwrap()
        );
        assert!(coerce_version("a-tag").is_none());
    }

    #[test]
    fn test_satisfies() {
        let v = Version::new(1, 2, 0);
        assert!(range_satisfies("^1.0.0", &v));
        assert!(!range_satisfies("^2.0.0", &v));
        assert!(!range_satisfies("git+https://example.com/x.git", &v));
    }

    proptest::proptest! {
        #[test]
        fn prop_caret_intersection_keeps_the_highest_bound(
            a in 0u64..20,
            b in 0u64..20,
            c in 0u64..20,
        ) {
            let ranges = [
                format!("^1.{}.0", a),
                format!("^1.{}.0", b),
                format!("^1.{}.0", c),
            ];
            let refs: Vec<&str> = ranges.iter().map(|s| s.as_str()).collect();
            let expected = format!("^1.{}.0", a.max(b).max(c));
            proptest::prop_assert_eq!(intersect_ranges(&refs).unwrap(), expected);
        }
    }
}
