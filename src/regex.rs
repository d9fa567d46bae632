//! Compile-once wrapper around PCRE2.
//!
//! Patterns are compiled with UTF and Unicode-property support and JIT when
//! the platform provides it. A pattern that is empty or fails to compile
//! degrades the matcher to a no-op: matching finds nothing and substitution
//! returns its input unchanged. That recovery is intentional, it keeps
//! legacy serialized tokenizers (whose patterns an older engine accepted)
//! loadable instead of failing the whole pipeline.

use pcre2::bytes::{Regex, RegexBuilder};

use crate::error::diagnostics_enabled;

/// Exact-match rewrites applied to search patterns before compilation, for
/// backward compatibility with patterns stored by older serialized
/// tokenizers.
static PATTERN_REWRITES: &[(&str, &str)] = &[
    // Bare clitic alternations predate grouped serialization and change
    // meaning when concatenated into a larger alternation.
    ("'s|'t|'re|'ve|'m|'ll|'d", "(?:'s|'t|'re|'ve|'m|'ll|'d)"),
    (" '", "(?: ')"),
];

/// A full match together with the span of its capture group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMatch {
    pub start: usize,
    pub end: usize,
    pub group_start: usize,
    pub group_end: usize,
}

/// One compiled PCRE2 pattern, thread-safe for matching and substitution.
pub struct PcreMatcher {
    re: Option<Regex>,
    pattern: String,
}

impl PcreMatcher {
    /// Compiles `pattern`, degrading to a no-op matcher on failure.
    pub fn new(pattern: &str) -> Self {
        let pattern = rewrite_legacy_pattern(pattern);
        if pattern.is_empty() {
            return Self { re: None, pattern };
        }
        let compiled = RegexBuilder::new()
            .utf(true)
            .ucp(true)
            .jit_if_available(true)
            .build(&pattern);
        let re = match compiled {
            Ok(re) => Some(re),
            Err(err) => {
                log::debug!("pattern {pattern:?} failed to compile: {err}");
                if diagnostics_enabled() {
                    eprintln!("[ ragtok ] pattern {pattern:?} failed to compile: {err}");
                }
                None
            }
        };
        Self { re, pattern }
    }

    /// The pattern text after legacy rewrites.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the matcher degraded to a pass-through no-op.
    pub fn is_noop(&self) -> bool {
        self.re.is_none()
    }

    /// Leftmost match at or after `start`. Empty matches are reported as
    /// `None` so callers iterating a cursor cannot loop forever.
    pub fn find_at(&self, text: &[u8], start: usize) -> Option<(usize, usize)> {
        let re = self.re.as_ref()?;
        match re.find_at(text, start) {
            Ok(Some(m)) if m.start() < m.end() => Some((m.start(), m.end())),
            _ => None,
        }
    }

    /// Leftmost match at or after `start` together with the single capture
    /// group whose span lies within the full match. Used by
    /// special-token isolation, where every token is its own group inside
    /// one alternation.
    pub fn match_with_group(&self, text: &[u8], start: usize) -> Option<GroupMatch> {
        let re = self.re.as_ref()?;
        let mut locations = re.capture_locations();
        let m = match re.captures_read_at(&mut locations, text, start) {
            Ok(Some(m)) if m.start() < m.end() => m,
            _ => return None,
        };
        for group in 1..locations.len() {
            if let Some((gs, ge)) = locations.get(group) {
                if gs >= m.start() && ge <= m.end() {
                    return Some(GroupMatch {
                        start: m.start(),
                        end: m.end(),
                        group_start: gs,
                        group_end: ge,
                    });
                }
            }
        }
        // No capture group matched inside the span; isolate the full match.
        Some(GroupMatch {
            start: m.start(),
            end: m.end(),
            group_start: m.start(),
            group_end: m.end(),
        })
    }

    /// Replaces the first (or, with `global`, all) matches with
    /// `replacement`. The replacement uses `$1`..`$9` back-references;
    /// legacy `\1`..`\9` inputs must be rewritten with
    /// [`rewrite_replacement`] first. A no-op matcher returns the input
    /// unchanged.
    pub fn substitute(&self, text: &[u8], replacement: &[u8], global: bool) -> Vec<u8> {
        let re = match self.re.as_ref() {
            Some(re) => re,
            None => return text.to_vec(),
        };
        let mut locations = re.capture_locations();
        let mut out = Vec::with_capacity(text.len());
        let mut cursor = 0usize;
        while cursor <= text.len() {
            let m = match re.captures_read_at(&mut locations, text, cursor) {
                Ok(Some(m)) => m,
                _ => break,
            };
            out.extend_from_slice(&text[cursor..m.start()]);
            expand_replacement(replacement, text, &locations, &mut out);
            if m.end() > m.start() {
                cursor = m.end();
            } else {
                // Step over empty matches to guarantee progress, keeping
                // the byte that would otherwise be skipped.
                if m.end() < text.len() {
                    out.push(text[m.end()]);
                }
                cursor = m.end() + 1;
            }
            if !global {
                break;
            }
        }
        if cursor < text.len() {
            out.extend_from_slice(&text[cursor..]);
        }
        out
    }
}

/// Applies the static legacy-pattern rewrite table.
fn rewrite_legacy_pattern(pattern: &str) -> String {
    for (old, new) in PATTERN_REWRITES {
        if pattern == *old {
            log::debug!("rewrote legacy pattern {old:?} to {new:?}");
            if diagnostics_enabled() {
                eprintln!("[ ragtok ] rewrote legacy pattern {old:?} to {new:?}");
            }
            return (*new).to_string();
        }
    }
    pattern.to_string()
}

/// Rewrites legacy `\1`..`\9` back-references in a replacement string to
/// the `$1`..`$9` form [`PcreMatcher::substitute`] expects.
pub fn rewrite_replacement(replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(replacement.len());
    let mut i = 0;
    while i < replacement.len() {
        if replacement[i] == b'\\'
            && i + 1 < replacement.len()
            && replacement[i + 1].is_ascii_digit()
        {
            out.push(b'$');
            out.push(replacement[i + 1]);
            i += 2;
        } else {
            out.push(replacement[i]);
            i += 1;
        }
    }
    out
}

fn expand_replacement(
    replacement: &[u8],
    text: &[u8],
    locations: &pcre2::bytes::CaptureLocations,
    out: &mut Vec<u8>,
) {
    let mut i = 0;
    while i < replacement.len() {
        if replacement[i] == b'$' && i + 1 < replacement.len() && replacement[i + 1].is_ascii_digit()
        {
            let group = (replacement[i + 1] - b'0') as usize;
            if let Some((gs, ge)) = locations.get(group) {
                out.extend_from_slice(&text[gs..ge]);
            }
            i += 2;
        } else {
            out.push(replacement[i]);
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_at() {
        let matcher = PcreMatcher::new(r"\d+");
        assert_eq!(matcher.find_at(b"ab12cd34", 0), Some((2, 4)));
        assert_eq!(matcher.find_at(b"ab12cd34", 4), Some((6, 8)));
        assert_eq!(matcher.find_at(b"abcd", 0), None);
    }

    #[test]
    fn test_empty_match_is_none() {
        // `a*` matches empty at position 0 of "bbb".
        let matcher = PcreMatcher::new("a*");
        assert_eq!(matcher.find_at(b"bbb", 0), None);
    }

    #[test]
    fn test_unicode_properties() {
        let matcher = PcreMatcher::new(r"\p{L}+");
        let text = "12кот34".as_bytes();
        assert_eq!(matcher.find_at(text, 0), Some((2, 8)));
    }

    #[test]
    fn test_bad_pattern_degrades_to_noop() {
        let matcher = PcreMatcher::new("([unclosed");
        assert!(matcher.is_noop());
        assert_eq!(matcher.find_at(b"anything", 0), None);
        assert_eq!(matcher.substitute(b"anything", b"x", true), b"anything");
    }

    #[test]
    fn test_empty_pattern_is_noop() {
        assert!(PcreMatcher::new("").is_noop());
    }

    #[test]
    fn test_match_with_group() {
        let matcher = PcreMatcher::new(r"(\[CLS\]|\[SEP\])");
        let m = matcher.match_with_group(b"x[SEP]y", 0).unwrap();
        assert_eq!((m.start, m.end), (1, 6));
        assert_eq!((m.group_start, m.group_end), (1, 6));
    }

    #[test]
    fn test_substitute_first_and_global() {
        let matcher = PcreMatcher::new(r"\d+");
        assert_eq!(matcher.substitute(b"a1b22c", b"#", false), b"a#b22c");
        assert_eq!(matcher.substitute(b"a1b22c", b"#", true), b"a#b#c");
    }

    #[test]
    fn test_substitute_backreference() {
        let matcher = PcreMatcher::new(r"(\w+)@");
        assert_eq!(matcher.substitute(b"user@host", b"<$1>", true), b"<user>host");
    }

    #[test]
    fn test_rewrite_replacement() {
        assert_eq!(rewrite_replacement(b"\\1-\\2"), b"$1-$2");
        assert_eq!(rewrite_replacement(b"plain \\\\"), b"plain \\\\");
    }

    #[test]
    fn test_legacy_pattern_rewrite() {
        let matcher = PcreMatcher::new("'s|'t|'re|'ve|'m|'ll|'d");
        assert_eq!(matcher.pattern(), "(?:'s|'t|'re|'ve|'m|'ll|'d)");
    }
}
