//! Pattern matching utilities
//!
//! Glob-style matching (`*`, `?`, `[...]` character classes) for the filter
//! store. Cache-file lines containing any glob metacharacter are treated as
//! patterns; everything else is a literal.

/// Returns true when `s` contains a glob metacharacter (`*`, `?` or `[`).
pub fn is_pattern(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'*' | b'?' | b'['))
}

/// Match a glob pattern against a value.
///
/// Supports:
/// - `*` - any run of characters, including empty
/// - `?` - any single character
/// - `[abc]`, `[a-z]`, `[!a-z]` - character classes with ranges and negation
///
/// An unterminated `[` class matches a literal `[`.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    match_bytes(pattern.as_bytes(), value.as_bytes())
}

fn match_bytes(mut pat: &[u8], mut val: &[u8]) -> bool {
    // Positions to restart from after the most recent `*`
    let mut star: Option<(&[u8], &[u8])> = None;

    loop {
        match (pat.first(), val.first()) {
            (Some(&b'*'), _) => {
                // Collapse runs of stars, remember the backtrack point
                while pat.first() == Some(&b'*') {
                    pat = &pat[1..];
                }
                star = Some((pat, val));
            }
            (Some(&p), Some(&v)) => {
                let consumed = match p {
                    b'?' => Some(1),
                    b'[' => match_class(&pat[1..], v).map(|used| used + 1),
                    _ if p == v => Some(1),
                    _ => None,
                };
                match consumed {
                    Some(used) => {
                        pat = &pat[used..];
                        val = &val[1..];
                        continue;
                    }
                    None => match star {
                        Some((p_restart, v_restart)) if !v_restart.is_empty() => {
                            pat = p_restart;
                            val = &v_restart[1..];
                            star = Some((p_restart, &v_restart[1..]));
                        }
                        _ => return false,
                    },
                }
            }
            (Some(_), None) => return false,
            (None, Some(_)) => match star {
                Some((p_restart, v_restart)) if !v_restart.is_empty() => {
                    pat = p_restart;
                    val = &v_restart[1..];
                    star = Some((p_restart, &v_restart[1..]));
                }
                _ => return false,
            },
            (None, None) => return true,
        }
    }
}

/// Match one character against a `[...]` class body (pattern after the `[`).
///
/// Returns the number of pattern bytes consumed (class body plus closing
/// bracket) on success, or `None` when the character is not in the class.
/// An unterminated class falls back to a literal `[` comparison.
fn match_class(class: &[u8], c: u8) -> Option<usize> {
    let negated = matches!(class.first(), Some(b'!') | Some(b'^'));
    let body_start = usize::from(negated);

    let mut i = body_start;
    let mut matched = false;
    loop {
        match class.get(i) {
            None => {
                // No closing bracket: `[` is a literal
                return if c == b'[' { Some(0) } else { None };
            }
            Some(&b']') if i > body_start => {
                let hit = matched != negated;
                return if hit { Some(i + 1) } else { None };
            }
            Some(&lo) => {
                if class.get(i + 1) == Some(&b'-') && class.get(i + 2).is_some_and(|&h| h != b']') {
                    let hi = class[i + 2];
                    if lo <= c && c <= hi {
                        matched = true;
                    }
                    i += 3;
                } else {
                    if c == lo {
                        matched = true;
                    }
                    i += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("10.0.*"));
        assert!(is_pattern("10.0.0.?"));
        assert!(is_pattern("10.0.0.[12]"));
        assert!(!is_pattern("10.0.0.1"));
    }

    #[test]
    fn test_exact_match() {
        assert!(glob_match("192.168.1.1", "192.168.1.1"));
        assert!(!glob_match("192.168.1.1", "192.168.1.2"));
    }

    #[test]
    fn test_star() {
        assert!(glob_match("10.*", "10.1.2.3"));
        assert!(glob_match("*.example.com", "api.example.com"));
        assert!(glob_match("10.*.3", "10.1.2.3"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("10.*", "11.1.2.3"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("10.0.0.?", "10.0.0.9"));
        assert!(!glob_match("10.0.0.?", "10.0.0.10"));
    }

    #[test]
    fn test_character_class() {
        assert!(glob_match("10.0.0.[12]", "10.0.0.1"));
        assert!(glob_match("10.0.0.[12]", "10.0.0.2"));
        assert!(!glob_match("10.0.0.[12]", "10.0.0.3"));
        assert!(glob_match("host-[a-c]", "host-b"));
        assert!(!glob_match("host-[a-c]", "host-d"));
        assert!(glob_match("host-[!a-c]", "host-d"));
    }

    #[test]
    fn test_multiple_stars() {
        assert!(glob_match("*bot*", "some evilbot/1.0"));
        assert!(glob_match("**", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_unterminated_class_is_literal() {
        assert!(glob_match("x[", "x["));
        assert!(!glob_match("x[", "xy"));
    }
}
