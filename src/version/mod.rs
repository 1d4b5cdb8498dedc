// src/version/mod.rs

//! Version comparison for package metadata
//!
//! Versions are compared rpm-style: the string is split into alternating
//! numeric and alphabetic segments, separators are ignored, and segments are
//! compared pairwise. A `~` marks a pre-release and sorts before anything,
//! including the end of the string.

use std::cmp::Ordering;

/// Compare two version strings
///
/// Examples:
/// - "1.10" > "1.9" (numeric segments compare by value)
/// - "1.0a" < "1.0.1" (numeric segments are newer than alphabetic ones)
/// - "1.0~rc1" < "1.0" (tilde sorts before the end of the string)
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let mut one = a.as_bytes();
    let mut two = b.as_bytes();

    loop {
        one = skip_separators(one);
        two = skip_separators(two);

        // Tilde handling: a pre-release marker loses against anything else
        match (one.first() == Some(&b'~'), two.first() == Some(&b'~')) {
            (true, true) => {
                one = &one[1..];
                two = &two[1..];
                continue;
            }
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        if one.is_empty() || two.is_empty() {
            break;
        }

        let numeric = one[0].is_ascii_digit();
        let (seg_one, rest_one) = split_segment(one, numeric);
        let (seg_two, rest_two) = split_segment(two, numeric);

        // Segment types differ: numeric is always newer
        if seg_two.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ordering = if numeric {
            compare_numeric(seg_one, seg_two)
        } else {
            seg_one.cmp(seg_two)
        };

        if ordering != Ordering::Equal {
            return ordering;
        }

        one = rest_one;
        two = rest_two;
    }

    // Whichever string has segments left over is newer
    match (one.is_empty(), two.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, _) => Ordering::Greater,
    }
}

/// Compare two `version-revision` pairs, version first
pub fn compare_full(version: &str, revision: u32, other_version: &str, other_revision: u32) -> Ordering {
    compare_versions(version, other_version).then(revision.cmp(&other_revision))
}

fn skip_separators(s: &[u8]) -> &[u8] {
    let start = s
        .iter()
        .position(|c| c.is_ascii_alphanumeric() || *c == b'~')
        .unwrap_or(s.len());
    &s[start..]
}

fn split_segment(s: &[u8], numeric: bool) -> (&[u8], &[u8]) {
    let end = s
        .iter()
        .position(|c| {
            if numeric {
                !c.is_ascii_digit()
            } else {
                !c.is_ascii_alphabetic()
            }
        })
        .unwrap_or(s.len());
    s.split_at(end)
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);

    // Longer digit runs are bigger numbers; equal lengths compare lexically
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|c| *c != b'0').unwrap_or(s.len());
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_versions() {
        assert_eq!(compare_versions("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0", "1_0"), Ordering::Equal);
        assert_eq!(compare_versions("1.01", "1.1"), Ordering::Equal);
    }

    #[test]
    fn test_numeric_segments() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "10.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn test_alpha_segments() {
        assert_eq!(compare_versions("1.0a", "1.0b"), Ordering::Less);
        assert_eq!(compare_versions("1.0a", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.1", "1.0a"), Ordering::Greater);
    }

    #[test]
    fn test_tilde_prerelease() {
        assert_eq!(compare_versions("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0~rc1"), Ordering::Greater);
        assert_eq!(compare_versions("1.0~rc1", "1.0~rc2"), Ordering::Less);
    }

    #[test]
    fn test_full_version_uses_revision() {
        assert_eq!(compare_full("1.0", 1, "1.0", 2), Ordering::Less);
        assert_eq!(compare_full("1.1", 1, "1.0", 9), Ordering::Greater);
        assert_eq!(compare_full("1.0", 3, "1.0", 3), Ordering::Equal);
    }
}
