//! Raw log line → chunk vector.
//!
//! Splits one access/error line into whitespace-separated chunks while
//! keeping quoted fields (request, referer, user agent) intact, working
//! around two producer quirks: quoted single spaces, and a stray
//! `HTTP/1.0"` literal whose extra quote would otherwise unbalance quoting.

use thiserror::Error;

/// Per-line failures. These skip the line; they never abort a cycle.
#[derive(Debug, Error)]
pub enum LineError {
    #[error("unbalanced quoting in chunk {0:?}")]
    BadQuoting(String),
    #[error("expected {expected} fields but got {got}")]
    BadArity { expected: usize, got: usize },
    #[error("bad timestamp {0:?}")]
    BadTimestamp(String),
    #[error("bad integer in {field}: {value:?}")]
    BadInteger { field: &'static str, value: String },
}

/// The stray literal the producer sometimes leaves inside fields.
const QUIRK: &str = "HTTP/1.0\"";
const QUIRK_HIDDEN: &str = "http/1.0\"";

/// Split a raw line into chunks, preserving field order and the interior
/// spacing of quoted chunks.
pub fn split_chunks(line: &str) -> Result<Vec<String>, LineError> {
    // Blanks and quoted blanks. A quoted single space becomes "_" so it
    // cannot be mistaken for a separator. One left-to-right collapse pass.
    let mut rec = line.to_string();
    if rec.contains("  ") {
        rec = rec.replace("  ", " ");
    }
    rec = rec.replace(" \" \" ", " \"_\" ");

    // The stray quote in `HTTP/1.0"` unbalances quoting. When the literal
    // follows a space it is a real token: hide it by case-folding and
    // restore after splitting. Mid-field occurrences are removed outright.
    let mut undo_hidden = false;
    loop {
        let at = match rec.find(QUIRK) {
            Some(at) => at,
            None => break,
        };
        if at > 0 && rec.as_bytes()[at - 1] == b' ' {
            rec = rec.replace(QUIRK, QUIRK_HIDDEN);
            undo_hidden = true;
        } else {
            rec = rec.replace(QUIRK, "");
        }
    }

    // Split on single spaces, then recombine quoted runs. A token opening
    // with `"` absorbs following tokens until one ends with `"` or `",`.
    let mut chunks: Vec<String> = Vec::new();
    let mut run = String::new();
    let mut quoted = false;
    for word in rec.split(' ') {
        if quoted {
            run.push(' ');
            run.push_str(word);
            if word.ends_with('"') || word.ends_with("\",") {
                chunks.push(std::mem::take(&mut run));
                quoted = false;
            }
        } else if word.starts_with('"') {
            if word.ends_with('"') || word.ends_with("\",") {
                chunks.push(word.to_string());
            } else {
                run = word.to_string();
                quoted = true;
            }
        } else {
            chunks.push(word.to_string());
        }
    }
    if quoted {
        // Unterminated run; fails the check below.
        chunks.push(run);
    }

    if undo_hidden {
        for chunk in &mut chunks {
            if chunk.contains(QUIRK_HIDDEN) {
                *chunk = chunk.replace(QUIRK_HIDDEN, QUIRK);
            }
        }
    }

    for chunk in &chunks {
        if chunk.starts_with('"') && !(chunk.ends_with('"') || chunk.ends_with("\",")) {
            return Err(LineError::BadQuoting(chunk.clone()));
        }
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A0: &str = r#"108.212.110.142 - - [03/Aug/2015:12:53:06 -0700] "GET /pix/t/American%20Eros%20by%20Mark%20Henderson HTTP/1.1" 200 46 "http://worldofmen.yuku.com/topic/9735/American-Eros-by-Mark-Henderson" "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_9_5) AppleWebKit/600.7.12 (KHTML, like Gecko) Version/7.1.7 Safari/537.85.16""#;

    #[test]
    fn test_access_line_chunks() {
        let chunks = split_chunks(A0).unwrap();
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[0], "108.212.110.142");
        assert_eq!(chunks[3], "[03/Aug/2015:12:53:06");
        assert_eq!(chunks[4], "-0700]");
        assert_eq!(
            chunks[5],
            r#""GET /pix/t/American%20Eros%20by%20Mark%20Henderson HTTP/1.1""#
        );
        assert_eq!(chunks[6], "200");
        assert!(chunks[9].starts_with(r#""Mozilla/5.0"#));
        assert!(chunks[9].ends_with(r#"Safari/537.85.16""#));
    }

    #[test]
    fn test_quoted_blank_becomes_underscore() {
        let line = r#"169.229.3.94 - - [05/Jun/2015:23:16:10 -0700] " " 400 181 "-" "-""#;
        let chunks = split_chunks(line).unwrap();
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[5], "\"_\"");
    }

    #[test]
    fn test_double_spaces_collapse() {
        let chunks = split_chunks("a  b c").unwrap();
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_quirk_mid_field_removed_everywhere() {
        // Mid-field occurrence: both the embedded literal and the later
        // token-adjacent one are stripped (replace-all semantics).
        let line = r#"x open() "/cgi-bin/search.plHTTP/1.0"" failed, request: "GET /cgi-bin/search.plHTTP/1.0" HTTP/1.1", host: "h""#;
        let chunks = split_chunks(line).unwrap();
        let joined = chunks.join("|");
        assert!(!joined.contains("HTTP/1.0\""), "quirk literal must be gone: {joined}");
        assert!(joined.contains(r#""GET /cgi-bin/search.pl HTTP/1.1","#));
    }

    #[test]
    fn test_quirk_after_space_survives() {
        let line = r#"80.69.249.123 - - [11/Dec/2015:14:58:49 -0800] "HEAD / HTTP/1.0" 200 0 "-" "-""#;
        let chunks = split_chunks(line).unwrap();
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[5], r#""HEAD / HTTP/1.0""#);
    }

    #[test]
    fn test_unterminated_quote_is_bad_quoting() {
        let err = split_chunks(r#"a "unterminated run of words"#).unwrap_err();
        assert!(matches!(err, LineError::BadQuoting(_)));
    }

    #[test]
    fn test_error_line_chunks() {
        let line = r#"2015/08/03 17:48:28 [error] 1199#0: *2502 open() "/var/www/x/wp-login.php" failed (2: No such file or directory), client: 58.8.154.9, server: 184.69.80.202, request: "GET /wp-login.php HTTP/1.1", host: "wp.go-print.com""#;
        let chunks = split_chunks(line).unwrap();
        assert_eq!(chunks[0], "2015/08/03");
        assert_eq!(chunks[1], "17:48:28");
        assert_eq!(chunks[2], "[error]");
        assert_eq!(chunks[3], "1199#0:");
        assert!(chunks.contains(&r#""GET /wp-login.php HTTP/1.1","#.to_string()));
    }
}
