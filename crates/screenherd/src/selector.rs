use crate::error::{Error, ErrorKind, Result};

/// Resolves an operator selector (`all` | `<n>` | `<n>,<n>,...`) against a
/// collection of `len` items. The result is ordered as written, duplicates
/// removed. Any malformed or out-of-range entry fails the whole selector.
pub fn resolve(token: &str, len: usize) -> Result<Vec<usize>> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("all") {
        return Ok((0..len).collect());
    }
    if token.is_empty() {
        return Err(invalid(token, "empty selector"));
    }

    let mut out = Vec::new();
    for part in token.split(',') {
        if part.is_empty() {
            return Err(invalid(token, "empty list entry"));
        }
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(token, &format!("'{part}' is not an index")));
        }
        let idx: usize = part
            .parse()
            .map_err(|_| invalid(token, &format!("'{part}' is not an index")))?;
        if idx >= len {
            return Err(invalid(
                token,
                &if len == 0 {
                    format!("index {idx} out of range (nothing to select)")
                } else {
                    format!("index {idx} out of range 0..{}", len - 1)
                },
            ));
        }
        if !out.contains(&idx) {
            out.push(idx);
        }
    }
    Ok(out)
}

/// Same grammar, restricted to one index (`view <n>`).
pub fn resolve_one(token: &str, len: usize) -> Result<usize> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("all") || token.contains(',') {
        return Err(invalid(token, "expected a single index"));
    }
    let picked = resolve(token, len)?;
    match picked.as_slice() {
        [one] => Ok(*one),
        _ => Err(invalid(token, "expected a single index")),
    }
}

fn invalid(token: &str, why: &str) -> Error {
    Error::new(ErrorKind::InvalidSelector, format!("'{token}': {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_selects_everything_in_order() {
        assert_eq!(resolve("all", 5).expect("all"), vec![0, 1, 2, 3, 4]);
        assert_eq!(resolve("ALL", 2).expect("ALL"), vec![0, 1]);
        assert!(resolve("all", 0).expect("empty all").is_empty());
    }

    #[test]
    fn single_and_list() {
        assert_eq!(resolve("3", 5).expect("single"), vec![3]);
        assert_eq!(resolve("1,3", 5).expect("list"), vec![1, 3]);
        assert_eq!(resolve("3,1,3", 5).expect("dupes"), vec![3, 1]);
    }

    #[test]
    fn out_of_range_fails_whole_selector() {
        for bad in ["9", "1,9", "5"] {
            let err = resolve(bad, 5).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::InvalidSelector, "{bad}");
        }
        assert!(resolve("0", 0).is_err());
    }

    #[test]
    fn malformed_tokens_fail() {
        for bad in ["", "1,", ",1", "1, 2", "-1", "+1", "a", "1-3", "1,,2", "0x1"] {
            let err = resolve(bad, 5).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::InvalidSelector, "{bad:?}");
        }
    }

    #[test]
    fn resolve_one_rejects_sets() {
        assert_eq!(resolve_one("2", 3).expect("one"), 2);
        assert!(resolve_one("all", 3).is_err());
        assert!(resolve_one("0,1", 3).is_err());
        assert!(resolve_one("3", 3).is_err());
    }
}
