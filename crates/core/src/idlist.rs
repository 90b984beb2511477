#![forbid(unsafe_code)]

//! Compact comma-separated encoding for lists of object ids.
//!
//! `,` separates ids; `\` escapes a literal `,` or `\` inside an id. Blank ids are never
//! written and are dropped on decode; every other id is kept byte for byte.

pub fn join_ids<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    let mut first = true;
    for id in ids {
        if id.trim().is_empty() {
            continue;
        }
        if !first {
            out.push(',');
        }
        first = false;
        for ch in id.chars() {
            if matches!(ch, ',' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
    }
    out
}

pub fn split_ids(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                // A dangling escape at the end of the input is dropped.
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => {
                let id = std::mem::take(&mut current);
                if !id.trim().is_empty() {
                    out.push(id);
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_inside_ids_survive() {
        let ids = ["a1b2-0001", "odd,id", "back\\slash", "plain"];
        let joined = join_ids(ids.iter().copied());
        assert_eq!(joined, "a1b2-0001,odd\\,id,back\\\\slash,plain");
        assert_eq!(split_ids(&joined), ids);
    }

    #[test]
    fn empty_segments_are_dropped() {
        assert_eq!(split_ids(",a,,b, ,"), vec!["a", "b"]);
        assert_eq!(join_ids(["", "x", ""]), "x");
        assert!(split_ids("").is_empty());
    }

    #[test]
    fn surrounding_whitespace_is_kept() {
        let joined = join_ids([" id-1 ", "  ", "id-2\t"]);
        assert_eq!(joined, " id-1 ,id-2\t");
        assert_eq!(split_ids(&joined), vec![" id-1 ", "id-2\t"]);
    }

    #[test]
    fn trailing_escape_is_ignored() {
        assert_eq!(split_ids("a,b\\"), vec!["a", "b"]);
    }
}
