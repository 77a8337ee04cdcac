//! Address parsing, wire-string padding, and OSC-style glob matching.

use crate::error::CoreError;

/// Pad a byte length up to the next multiple of 4, as the wire format
/// requires for every string and blob field.
pub fn padded_len(len: usize) -> usize {
    (len + 4) & !3
}

/// Encode a string as a NUL-terminated, NUL-padded, 4-byte-aligned field.
pub fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.as_bytes());
    let total = padded_len(s.len());
    out.resize(out.len() + (total - s.len()), 0);
}

/// Decode a NUL-terminated, 4-byte-aligned string field starting at `offset`.
/// Returns the decoded string and the offset just past its padding.
pub fn decode_string(buf: &[u8], offset: usize) -> crate::error::Result<(String, usize)> {
    let nul = buf[offset..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CoreError::BadMessage("unterminated string field".into()))?;
    let s = std::str::from_utf8(&buf[offset..offset + nul])
        .map_err(|_| CoreError::BadMessage("string field is not valid utf-8".into()))?
        .to_string();
    let consumed = padded_len(nul);
    Ok((s, offset + consumed))
}

/// An address is either a literal full path (`!`-prefixed fast path, no
/// pattern characters permitted past the service segment) or a pattern path
/// that may contain OSC glob segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Literal(String),
    Pattern(String),
}

impl Address {
    /// Parse a wire address, classifying it by its leading sigil and
    /// whether any segment past the service name contains glob metacharacters.
    pub fn parse(path: &str) -> crate::error::Result<Address> {
        if let Some(rest) = path.strip_prefix('!') {
            if rest.is_empty() || !rest.starts_with('/') {
                return Err(CoreError::BadAddress(path.to_string()));
            }
            return Ok(Address::Literal(rest.to_string()));
        }
        if !path.starts_with('/') {
            return Err(CoreError::BadAddress(path.to_string()));
        }
        if is_pattern_path(path) {
            Ok(Address::Pattern(path.to_string()))
        } else {
            Ok(Address::Literal(path.to_string()))
        }
    }

    pub fn service_name(&self) -> &str {
        let full = match self {
            Address::Literal(p) | Address::Pattern(p) => p.as_str(),
        };
        let rest = &full[1..];
        match rest.find('/') {
            Some(i) => &rest[..i],
            None => rest,
        }
    }

    pub fn full_path(&self) -> &str {
        match self {
            Address::Literal(p) | Address::Pattern(p) => p.as_str(),
        }
    }
}

fn is_pattern_path(path: &str) -> bool {
    path.chars().any(|c| matches!(c, '?' | '*' | '[' | '{'))
}

/// Match a single address segment (no `/`) against an OSC glob pattern
/// segment. Supports `?`, `*`, `[abc]`, `[!abc]`, `[a-z]`, and `{alt1,alt2}`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    glob_match_inner(pattern.as_bytes(), text.as_bytes())
}

fn glob_match_inner(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            if glob_match_inner(&pattern[1..], text) {
                return true;
            }
            !text.is_empty() && glob_match_inner(pattern, &text[1..])
        }
        Some(b'?') => !text.is_empty() && glob_match_inner(&pattern[1..], &text[1..]),
        Some(b'[') => match_bracket(pattern, text),
        Some(b'{') => match_brace(pattern, text),
        Some(&c) => !text.is_empty() && text[0] == c && glob_match_inner(&pattern[1..], &text[1..]),
    }
}

fn match_bracket(pattern: &[u8], text: &[u8]) -> bool {
    let close = match pattern.iter().position(|&b| b == b']') {
        Some(i) => i,
        None => return false,
    };
    if text.is_empty() {
        return false;
    }
    let mut body = &pattern[1..close];
    let negate = body.first() == Some(&b'!');
    if negate {
        body = &body[1..];
    }
    let c = text[0];
    let mut matched = false;
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == b'-' {
            if body[i] <= c && c <= body[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if body[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    if matched == negate {
        return false;
    }
    glob_match_inner(&pattern[close + 1..], &text[1..])
}

fn match_brace(pattern: &[u8], text: &[u8]) -> bool {
    let close = match pattern.iter().position(|&b| b == b'}') {
        Some(i) => i,
        None => return false,
    };
    let body = &pattern[1..close];
    let rest = &pattern[close + 1..];
    for alt in body.split(|&b| b == b',') {
        let mut candidate = alt.to_vec();
        candidate.extend_from_slice(rest);
        if glob_match_inner(&candidate, text) {
            return true;
        }
    }
    false
}

/// Split a full path (leading `/` already stripped of the service segment)
/// into its `/`-delimited segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.trim_start_matches('/').split('/').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_prefix_skips_pattern_classification() {
        let addr = Address::parse("!/synth/1/freq").unwrap();
        assert_eq!(addr, Address::Literal("/synth/1/freq".into()));
    }

    #[test]
    fn bare_glob_segment_is_a_pattern() {
        let addr = Address::parse("/synth/*/freq").unwrap();
        assert_eq!(addr, Address::Pattern("/synth/*/freq".into()));
    }

    #[test]
    fn bare_path_without_metacharacters_is_literal() {
        let addr = Address::parse("/synth/1/freq").unwrap();
        assert_eq!(addr, Address::Literal("/synth/1/freq".into()));
    }

    #[test]
    fn service_name_extracts_first_segment() {
        let addr = Address::parse("/synth/1/freq").unwrap();
        assert_eq!(addr.service_name(), "synth");
    }

    #[test]
    fn star_matches_any_run_within_segment() {
        assert!(glob_match("tr*ck", "track"));
        assert!(glob_match("tr*ck", "truck"));
        assert!(!glob_match("tr*ck", "tracks"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(glob_match("ch?nnel", "channel"));
        assert!(!glob_match("ch?nnel", "channnel"));
    }

    #[test]
    fn bracket_set_and_negation() {
        assert!(glob_match("ch[ae]nnel", "channel"));
        assert!(glob_match("ch[ae]nnel", "chennel"));
        assert!(!glob_match("ch[!ae]nnel", "channel"));
        assert!(glob_match("ch[!ae]nnel", "chonnel"));
    }

    #[test]
    fn bracket_range() {
        assert!(glob_match("track[1-3]", "track2"));
        assert!(!glob_match("track[1-3]", "track9"));
    }

    #[test]
    fn brace_alternation() {
        assert!(glob_match("{kick,snare}", "kick"));
        assert!(glob_match("{kick,snare}", "snare"));
        assert!(!glob_match("{kick,snare}", "hat"));
    }

    #[test]
    fn string_round_trips_through_padding() {
        let mut buf = Vec::new();
        encode_string("tempo", &mut buf);
        assert_eq!(buf.len(), padded_len("tempo".len()));
        let (s, next) = decode_string(&buf, 0).unwrap();
        assert_eq!(s, "tempo");
        assert_eq!(next, buf.len());
    }
}
