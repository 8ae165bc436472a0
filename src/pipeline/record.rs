//! Chunk vector → canonical output record.
//!
//! Every frame on the wire is one JSON object with sorted keys, ASCII-safe
//! escaping, and the common header `{_ip,_ts,_id,_si,_el,_sl,ae}`. The `_ts`
//! blank-decimal shape (`"1438631586.    "`) is load-bearing downstream and
//! must not change.

use serde_json::{json, Value};

use crate::clock::{self, Clock};
use crate::files::LogType;
use crate::pipeline::parser::LineError;

/// Identity fields stamped into every record.
#[derive(Debug, Clone)]
pub struct SourceIds {
    pub srcid: String,
    pub subid: String,
    /// Raw base error level.
    pub el: String,
    /// Raw base sub level; the watcher stamps the log tag here.
    pub sl: String,
}

/// A record ready for the transport.
#[derive(Debug, Clone)]
pub struct Frame {
    pub json: String,
    pub ts: String,
    pub ae: char,
    /// Short operator preview (`txtlen` diagnostics).
    pub preview: String,
}

impl Frame {
    /// `_ts|ae|json` — the sortable decorated form.
    pub fn decorated(&self) -> String {
        format!("{}|{}|{}", self.ts, self.ae, self.json)
    }
}

/// Build a frame for one line of the given log type.
pub fn build(
    ty: LogType,
    chunks: &[String],
    ids: &SourceIds,
    clock: &Clock,
) -> Result<Frame, LineError> {
    match ty {
        LogType::Access => build_access(chunks, ids, clock),
        LogType::Error => build_error(chunks, ids, clock),
    }
}

/// Access variant: exactly ten chunks.
/// `remote_addr ident remote_user [date lhs] [date rhs] request status
///  body_bytes_sent http_referer http_user_agent`
pub fn build_access(
    chunks: &[String],
    ids: &SourceIds,
    clock: &Clock,
) -> Result<Frame, LineError> {
    if chunks.len() != 10 {
        return Err(LineError::BadArity {
            expected: 10,
            got: chunks.len(),
        });
    }

    let remote_addr = chunks[0].clone();
    let remote_user = if chunks[2] == "-" {
        None
    } else {
        Some(chunks[2].clone())
    };
    let time_local = format!("{} {}", chunks[3], chunks[4]);
    let time_utc = clock
        .parse_access_time(&time_local)
        .map_err(|_| LineError::BadTimestamp(time_local.clone()))?;
    let request = clean(&chunks[5]);
    let status = parse_int("status", &chunks[6])?;
    let body_bytes_sent = parse_int("body_bytes_sent", &chunks[7])?;
    let http_referer = clean(&chunks[8]);
    let http_user_agent = clean(&chunks[9]);

    let ts = clock::blank_decimal(time_utc);
    let preview = format!(
        "{}|{}|{}|a|{}",
        ip15(&remote_addr),
        ids.el,
        ids.sl,
        request.as_deref().unwrap_or("")
    );

    let record = json!({
        "_ip": Value::Null,
        "_ts": ts.clone(),
        "_id": ids.srcid,
        "_si": ids.subid,
        "_el": ids.el,
        "_sl": ids.sl,
        "ae": "a",
        "remote_addr": remote_addr,
        "remote_user": remote_user,
        "time_local": time_local,
        "time_utc": time_utc,
        "status": status,
        "request": request,
        "body_bytes_sent": body_bytes_sent,
        "http_referer": http_referer,
        "http_user_agent": http_user_agent,
    });

    Ok(Frame {
        json: to_ascii_json(&record),
        ts,
        ae: 'a',
        preview,
    })
}

/// Error variant: leading `YYYY/MM/DD HH:MM:SS` in the configured local
/// zone, a `[warn]`/`[error]` status token, and a tab-joined residue.
pub fn build_error(chunks: &[String], ids: &SourceIds, clock: &Clock) -> Result<Frame, LineError> {
    if chunks.len() < 2 {
        return Err(LineError::BadTimestamp(chunks.join(" ")));
    }

    let time_local = format!("{} {}", chunks[0], chunks[1]);
    let time_utc = clock
        .parse_error_time(&time_local)
        .map_err(|_| LineError::BadTimestamp(time_local.clone()))?;

    let status = chunks.get(2).cloned().unwrap_or_default();
    if status != "[warn]" && status != "[error]" {
        // Accepted, but flagged: the producer's levels are not closed.
        tracing::warn!("unexpected error-log status: {:?}", status);
    }

    let rest: &[String] = if chunks.len() > 3 { &chunks[3..] } else { &[] };
    let stuff = rest.join("\t");

    // Best-effort display fields scanned out of the residue.
    let mut remote_addr = "999.999.999.999".to_string();
    let mut server = String::new();
    let mut request = String::new();
    let mut it = rest.iter();
    while let Some(tok) = it.next() {
        match tok.as_str() {
            "client:" => {
                if let Some(v) = it.next() {
                    remote_addr = v.trim_end_matches(',').to_string();
                }
            }
            "server:" => {
                if let Some(v) = it.next() {
                    server = v.trim_end_matches(',').to_string();
                }
            }
            "request:" => {
                if let Some(v) = it.next() {
                    request = v.trim_end_matches(',').to_string();
                }
            }
            _ => {}
        }
    }

    let ts = clock::blank_decimal(time_utc);
    let preview = format!(
        "{}|{}|{}|e|{} {}",
        ip15(&remote_addr),
        ids.el,
        ids.sl,
        server,
        request
    );

    let record = json!({
        "_ip": Value::Null,
        "_ts": ts.clone(),
        "_id": ids.srcid,
        "_si": ids.subid,
        "_el": ids.el,
        "_sl": ids.sl,
        "ae": "e",
        "time_local": time_local,
        "time_utc": time_utc,
        "status": status,
        "stuff": stuff,
    });

    Ok(Frame {
        json: to_ascii_json(&record),
        ts,
        ae: 'e',
        preview,
    })
}

/// Heartbeat record: current wall times, unblanked fractional `_ts`.
pub fn build_heartbeat(ids: &SourceIds, clock: &Clock) -> Frame {
    let utc = clock.utc_now();
    let loc = clock.local_now();
    let ts = clock::full_decimal(utc);

    let record = json!({
        "_ip": Value::Null,
        "_ts": ts.clone(),
        "_id": ids.srcid,
        "_si": ids.subid,
        "_el": "0",
        "_sl": "h",
        "ae": "h",
        "dt_utc": clock::iso_frac(utc),
        "dt_loc": clock::iso_frac(loc),
    });

    Frame {
        json: to_ascii_json(&record),
        ts,
        ae: 'h',
        preview: String::new(),
    }
}

/// Trim whitespace, strip trailing commas and quotes; `-`, blank, empty → None.
fn clean(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let s = s.trim_end_matches(',').replace('"', "");
    if s == "-" || s == " " || s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_int(field: &'static str, s: &str) -> Result<i64, LineError> {
    s.parse::<i64>().map_err(|_| LineError::BadInteger {
        field,
        value: s.to_string(),
    })
}

/// Pad an IPv4 address to 3-digit octets (15 chars) for aligned previews.
/// Anything that doesn't pad to exactly 15 chars is returned untouched.
fn ip15(ip: &str) -> String {
    let octets: Option<Vec<String>> = ip
        .split('.')
        .map(|o| o.trim().parse::<u32>().ok().map(|n| format!("{n:03}")))
        .collect();
    match octets {
        Some(parts) => {
            let padded = parts.join(".");
            if padded.len() == 15 {
                padded
            } else {
                ip.to_string()
            }
        }
        None => ip.to_string(),
    }
}

/// Serialize with sorted keys (serde_json's map is ordered) and escape
/// everything outside ASCII as `\uXXXX`, surrogate pairs included.
fn to_ascii_json(value: &Value) -> String {
    let raw = value.to_string();
    if raw.is_ascii() {
        return raw;
    }
    let mut out = String::with_capacity(raw.len() + 16);
    let mut units = [0u16; 2];
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parser::split_chunks;
    use pretty_assertions::assert_eq;

    fn clock() -> Clock {
        Clock::new(crate::clock::DEFAULT_TZ.parse().unwrap())
    }

    fn test_ids() -> SourceIds {
        SourceIds {
            srcid: "TEST".into(),
            subid: "test".into(),
            el: "0".into(),
            sl: "_".into(),
        }
    }

    fn frame_for(line: &str, ty: LogType) -> Frame {
        let chunks = split_chunks(line).unwrap();
        build(ty, &chunks, &test_ids(), &clock()).unwrap()
    }

    #[test]
    fn test_access_record_fields() {
        let line = r#"108.212.110.142 - - [03/Aug/2015:12:53:06 -0700] "GET /pix/t/American%20Eros%20by%20Mark%20Henderson HTTP/1.1" 200 46 "http://worldofmen.yuku.com/topic/9735/American-Eros-by-Mark-Henderson" "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_9_5) AppleWebKit/600.7.12 (KHTML, like Gecko) Version/7.1.7 Safari/537.85.16""#;
        let frame = frame_for(line, LogType::Access);
        let v: Value = serde_json::from_str(&frame.json).unwrap();

        assert_eq!(v["_ts"], "1438631586.    ");
        assert_eq!(v["time_utc"], 1438631586);
        assert_eq!(v["time_local"], "[03/Aug/2015:12:53:06 -0700]");
        assert_eq!(v["status"], 200);
        assert_eq!(v["body_bytes_sent"], 46);
        assert_eq!(v["remote_addr"], "108.212.110.142");
        assert_eq!(v["remote_user"], Value::Null);
        assert_eq!(v["_ip"], Value::Null);
        assert_eq!(v["_id"], "TEST");
        assert_eq!(v["_si"], "test");
        assert_eq!(v["_el"], "0");
        assert_eq!(v["_sl"], "_");
        assert_eq!(v["ae"], "a");
        assert_eq!(
            v["request"],
            "GET /pix/t/American%20Eros%20by%20Mark%20Henderson HTTP/1.1"
        );
    }

    #[test]
    fn test_access_keys_sorted() {
        let line = r#"80.69.249.123 - - [11/Dec/2015:14:58:49 -0800] "HEAD / HTTP/1.0" 200 0 "-" "-""#;
        let frame = frame_for(line, LogType::Access);
        // Top-level keys appear in byte-sorted order in the serialized text.
        let keys: Vec<&str> = [
            "_el", "_id", "_ip", "_si", "_sl", "_ts", "ae", "body_bytes_sent",
            "http_referer", "http_user_agent", "remote_addr", "remote_user",
            "request", "status", "time_local", "time_utc",
        ]
        .to_vec();
        let mut at = 0;
        for key in keys {
            let needle = format!("\"{key}\":");
            let pos = frame.json[at..]
                .find(&needle)
                .unwrap_or_else(|| panic!("{key} out of order in {}", frame.json));
            at += pos;
        }
    }

    #[test]
    fn test_blank_request_survives_as_underscore() {
        let line = r#"169.229.3.94 - - [05/Jun/2015:23:16:10 -0700] " " 400 181 "-" "-""#;
        let frame = frame_for(line, LogType::Access);
        let v: Value = serde_json::from_str(&frame.json).unwrap();
        assert_eq!(v["request"], "_");
        assert_eq!(v["http_referer"], Value::Null);
        assert_eq!(v["http_user_agent"], Value::Null);
        assert_eq!(v["status"], 400);
        assert_eq!(v["_ts"], "1433571370.    ");
    }

    #[test]
    fn test_access_arity() {
        let chunks = split_chunks("1.2.3.4 - -").unwrap();
        let err = build_access(&chunks, &test_ids(), &clock()).unwrap_err();
        assert!(matches!(err, LineError::BadArity { got: 3, .. }));
    }

    #[test]
    fn test_access_bad_integer() {
        let line = r#"1.2.3.4 - - [03/Aug/2015:12:53:06 -0700] "GET / HTTP/1.1" abc 46 "-" "-""#;
        let chunks = split_chunks(line).unwrap();
        let err = build_access(&chunks, &test_ids(), &clock()).unwrap_err();
        assert!(matches!(err, LineError::BadInteger { field: "status", .. }));
    }

    #[test]
    fn test_access_bad_timestamp() {
        let line = r#"1.2.3.4 - - [99/Xxx/2015:12:53:06 -0700] "GET / HTTP/1.1" 200 46 "-" "-""#;
        let chunks = split_chunks(line).unwrap();
        let err = build_access(&chunks, &test_ids(), &clock()).unwrap_err();
        assert!(matches!(err, LineError::BadTimestamp(_)));
    }

    #[test]
    fn test_error_record_fields() {
        let line = r#"2015/08/03 17:48:28 [error] 1199#0: *2502 open() "/var/www/184.69.80.202/wordpress/wp-login.php" failed (2: No such file or directory), client: 58.8.154.9, server: 184.69.80.202, request: "GET /wordpress/wp-login.php HTTP/1.1", host: "wp.go-print.com""#;
        let frame = frame_for(line, LogType::Error);
        let v: Value = serde_json::from_str(&frame.json).unwrap();

        assert_eq!(v["ae"], "e");
        assert_eq!(v["status"], "[error]");
        assert_eq!(v["time_utc"], 1438649308);
        assert_eq!(v["time_local"], "2015/08/03 17:48:28");
        assert_eq!(v["_ts"], "1438649308.    ");
        let stuff = v["stuff"].as_str().unwrap();
        assert!(stuff.starts_with("1199#0:\t*2502\topen()"));
        assert!(stuff.contains("client:\t58.8.154.9,"));
    }

    #[test]
    fn test_error_warn_status() {
        let line = r#"2015/11/24 07:59:56 [warn] 32401#0: only the last index in "index" directive should be absolute in /etc/nginx/vhosts.cfg:113"#;
        let frame = frame_for(line, LogType::Error);
        let v: Value = serde_json::from_str(&frame.json).unwrap();
        assert_eq!(v["status"], "[warn]");
        assert_eq!(v["time_utc"], 1448380796);
    }

    #[test]
    fn test_error_unknown_status_accepted() {
        let line = "2015/08/03 17:48:28 [notice] something happened";
        let frame = frame_for(line, LogType::Error);
        let v: Value = serde_json::from_str(&frame.json).unwrap();
        assert_eq!(v["status"], "[notice]");
        assert_eq!(v["stuff"], "something\thappened");
    }

    #[test]
    fn test_roundtrip_stable() {
        // parse(serialize(r)) == r, and re-serializing is byte-identical.
        let line = r#"184.69.80.202 - - [07/Dec/2015:15:04:31 -0800] "GET /dcm/dcTnPD/T1/0/4/15/-.-? HTTP/1.1" 200 1504 "http://184.69.80.202/dcm/dcTnPD/T1/1/4/15/-.-" "Mozilla/5.0 (Windows NT 5.1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/46.0.2490.86 Safari/537.36""#;
        let frame = frame_for(line, LogType::Access);
        let v: Value = serde_json::from_str(&frame.json).unwrap();
        assert_eq!(v.to_string(), frame.json);
    }

    #[test]
    fn test_decorated_frame() {
        let line = r#"80.69.249.123 - - [11/Dec/2015:14:58:49 -0800] "HEAD / HTTP/1.0" 200 0 "-" "-""#;
        let frame = frame_for(line, LogType::Access);
        let decorated = frame.decorated();
        assert!(decorated.starts_with("1449874729.    |a|{"));
    }

    #[test]
    fn test_heartbeat_record() {
        let frame = build_heartbeat(&test_ids(), &clock());
        let v: Value = serde_json::from_str(&frame.json).unwrap();
        assert_eq!(v["ae"], "h");
        assert_eq!(v["_sl"], "h");
        assert_eq!(v["_el"], "0");
        // Unblanked fractional timestamp, decimal point intact.
        let ts = v["_ts"].as_str().unwrap();
        assert_eq!(ts.len(), 15);
        assert!(ts.contains('.'));
        assert!(!ts.ends_with("    "));
        assert!(v["dt_utc"].as_str().unwrap().contains('.'));
        assert!(v["dt_loc"].as_str().unwrap().contains('.'));
    }

    #[test]
    fn test_ascii_escaping() {
        let v = json!({"stuff": "naïve café — ≠"});
        let s = to_ascii_json(&v);
        assert!(s.is_ascii());
        assert!(s.contains("\\u00ef"));
        let back: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(back["stuff"], "naïve café — ≠");
    }

    #[test]
    fn test_ip15() {
        assert_eq!(ip15("8.8.8.8"), "008.008.008.008");
        assert_eq!(ip15("108.212.110.142"), "108.212.110.142");
        assert_eq!(ip15("999.999.999.999"), "999.999.999.999");
        assert_eq!(ip15("not-an-ip"), "not-an-ip");
    }
}
