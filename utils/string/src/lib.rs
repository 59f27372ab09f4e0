// Truncate a &str to a byte budget at a char boundary (prefix)
#[inline]
pub fn take_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut last_ok = 0;
    for (i, ch) in s.char_indices() {
        let nb = i + ch.len_utf8();
        if nb > maxb {
            break;
        }
        last_ok = nb;
    }
    &s[..last_ok]
}

// Take a suffix of a &str within a byte budget at a char boundary
#[inline]
pub fn take_last_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut start = s.len();
    let mut used = 0usize;
    for (i, ch) in s.char_indices().rev() {
        let nb = ch.len_utf8();
        if used + nb > maxb {
            break;
        }
        start = i;
        used += nb;
        if start == 0 {
            break;
        }
    }
    &s[start..]
}

/// Keep the head and tail of `s` within `maxb` bytes, replacing the middle
/// with a marker naming how many bytes were dropped.
pub fn truncate_middle(s: &str, maxb: usize) -> String {
    if s.len() <= maxb {
        return s.to_string();
    }
    let marker = format!("\n…{} bytes truncated…\n", s.len().saturating_sub(maxb));
    let budget = maxb.saturating_sub(marker.len());
    let head = take_bytes_at_char_boundary(s, budget / 2);
    let tail = take_last_bytes_at_char_boundary(s, budget - head.len());
    format!("{head}{marker}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_never_splits_a_char() {
        assert_eq!(take_bytes_at_char_boundary("héllo", 2), "h");
        assert_eq!(take_bytes_at_char_boundary("héllo", 3), "hé");
        assert_eq!(take_bytes_at_char_boundary("abc", 10), "abc");
    }

    #[test]
    fn suffix_never_splits_a_char() {
        assert_eq!(take_last_bytes_at_char_boundary("abcé", 1), "");
        assert_eq!(take_last_bytes_at_char_boundary("abcé", 2), "é");
        assert_eq!(take_last_bytes_at_char_boundary("abcé", 3), "cé");
    }

    #[test]
    fn middle_truncation_keeps_both_ends() {
        let input = "a".repeat(100) + &"z".repeat(100);
        let out = truncate_middle(&input, 80);
        assert!(out.starts_with('a'));
        assert!(out.ends_with('z'));
        assert!(out.contains("bytes truncated"));
        assert!(out.len() <= 80);
    }
}
