//! Persistent entry file: an INI-style text format, one typed entry per line.
//!
//! ```text
//! [NetworkTables Storage 3.0]
//! boolean "/robot/enabled"=true
//! double "/robot/speed"=1.5
//! string "/robot/name"="ada"
//! raw "/blob"=AQID
//! array double "/pid"=0.1,0,2
//! array string "/modes"="auto","teleop"
//! ```

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::warn;

use crate::value::Value;

pub const PERSISTENT_SECTION: &str = "[NetworkTables Storage 3.0]";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}: persistent section not found")]
    MissingSection(String),
}

/// Parse entries from `reader`. Malformed lines are logged and skipped;
/// a file without the storage section is an error.
pub fn load<R: BufRead>(reader: R, source: &str) -> Result<Vec<(String, Value)>, PersistError> {
    let mut entries = Vec::new();
    let mut found_section = false;
    let mut in_section = false;
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            in_section = line == PERSISTENT_SECTION;
            found_section |= in_section;
            continue;
        }
        if !in_section {
            continue;
        }
        match parse_line(line) {
            Ok(entry) => entries.push(entry),
            Err(msg) => warn!("{}:{}: {}", source, n + 1, msg),
        }
    }
    if !found_section {
        return Err(PersistError::MissingSection(source.to_owned()));
    }
    Ok(entries)
}

const TYPE_PREFIXES: [&str; 7] = [
    "array boolean ",
    "array double ",
    "array string ",
    "boolean ",
    "double ",
    "string ",
    "raw ",
];

fn parse_line(line: &str) -> Result<(String, Value), String> {
    let kind = TYPE_PREFIXES
        .iter()
        .find(|p| line.starts_with(*p))
        .ok_or_else(|| format!("unrecognized type in {:?}", line))?;
    let rest = &line[kind.len()..];
    let (name, rest) = take_quoted(rest).ok_or_else(|| format!("bad name in {:?}", line))?;
    let value = rest
        .trim_start()
        .strip_prefix('=')
        .ok_or_else(|| format!("missing '=' after {:?}", name))?
        .trim();
    let value = match kind.trim_end() {
        "boolean" => Value::Boolean(parse_bool(value)?),
        "double" => Value::Double(parse_double(value)?),
        "string" => {
            let (s, tail) =
                take_quoted(value).ok_or_else(|| format!("bad string value for {:?}", name))?;
            if !tail.trim().is_empty() {
                return Err(format!("trailing data after string value for {:?}", name));
            }
            Value::String(s)
        }
        "raw" => Value::Raw(
            BASE64
                .decode(value)
                .map_err(|e| format!("bad raw value for {:?}: {}", name, e))?,
        ),
        "array boolean" => Value::BooleanArray(
            split_list(value)
                .map(parse_bool)
                .collect::<Result<_, _>>()?,
        ),
        "array double" => Value::DoubleArray(
            split_list(value)
                .map(parse_double)
                .collect::<Result<_, _>>()?,
        ),
        "array string" => {
            let mut items = Vec::new();
            let mut rest = value;
            while !rest.is_empty() {
                let (s, tail) = take_quoted(rest)
                    .ok_or_else(|| format!("bad string array for {:?}", name))?;
                items.push(s);
                rest = tail.trim_start();
                rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
            }
            Value::StringArray(items)
        }
        other => return Err(format!("unrecognized type {:?}", other)),
    };
    Ok((name, value))
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("unrecognized boolean {:?}", other)),
    }
}

fn parse_double(s: &str) -> Result<f64, String> {
    s.parse::<f64>()
        .map_err(|_| format!("unrecognized double {:?}", s))
}

/// Read a `"..."` string with escapes from the front of `s`; returns it and what follows.
fn take_quoted(s: &str) -> Option<(String, &str)> {
    let body = s.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Some((String::from_utf8_lossy(&out).into_owned(), &body[i + 1..])),
            b'\\' => {
                let c = *bytes.get(i + 1)?;
                i += 2;
                match c {
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'x' => {
                        let hex = body.get(i..i + 2)?;
                        out.push(u8::from_str_radix(hex, 16).ok()?);
                        i += 2;
                    }
                    other => out.push(other),
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    None
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\r' => out.push_str("\\r"),
            32..=126 => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

/// Write entries in file format. RPC values are not persisted.
pub fn save<W: Write>(mut w: W, entries: &[(String, Value)]) -> io::Result<()> {
    writeln!(w, "{}", PERSISTENT_SECTION)?;
    for (name, value) in entries {
        let name = escape(name);
        match value {
            Value::Boolean(b) => writeln!(w, "boolean \"{}\"={}", name, b)?,
            Value::Double(d) => writeln!(w, "double \"{}\"={}", name, d)?,
            Value::String(s) => writeln!(w, "string \"{}\"=\"{}\"", name, escape(s))?,
            Value::Raw(r) => writeln!(w, "raw \"{}\"={}", name, BASE64.encode(r))?,
            Value::BooleanArray(v) => {
                let items: Vec<&str> = v.iter().map(|b| if *b { "true" } else { "false" }).collect();
                writeln!(w, "array boolean \"{}\"={}", name, items.join(","))?
            }
            Value::DoubleArray(v) => {
                let items: Vec<String> = v.iter().map(f64::to_string).collect();
                writeln!(w, "array double \"{}\"={}", name, items.join(","))?
            }
            Value::StringArray(v) => {
                let items: Vec<String> = v.iter().map(|s| format!("\"{}\"", escape(s))).collect();
                writeln!(w, "array string \"{}\"={}", name, items.join(","))?
            }
            Value::Rpc(_) => {}
        }
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Save atomically: write `<path>.tmp`, keep the previous file as `<path>.bak`, rename into place.
pub fn save_file(path: &Path, entries: &[(String, Value)]) -> Result<(), PersistError> {
    let tmp = sibling(path, ".tmp");
    let bak = sibling(path, ".bak");
    {
        let file = File::create(&tmp)?;
        let mut w = BufWriter::new(file);
        save(&mut w, entries)?;
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    match fs::rename(path, &bak) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not keep backup {}: {}", bak.display(), e),
    }
    if let Err(e) = fs::rename(&tmp, path) {
        // put the previous file back
        let _ = fs::rename(&bak, path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(String, Value)> {
        vec![
            ("/bool".into(), Value::Boolean(true)),
            ("/double".into(), Value::Double(1.5)),
            ("/str \"quoted\"\n".into(), Value::String("a\\b\tc\u{1}".into())),
            ("/raw".into(), Value::Raw(vec![0, 1, 2, 255])),
            ("/bools".into(), Value::BooleanArray(vec![true, false])),
            ("/doubles".into(), Value::DoubleArray(vec![0.5, -2.0, 1e10])),
            ("/strings".into(), Value::StringArray(vec!["x,y".into(), "".into(), "é".into()])),
            ("/empty".into(), Value::StringArray(vec![])),
        ]
    }

    #[test]
    fn save_then_load() {
        let mut buf = Vec::new();
        save(&mut buf, &sample()).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with(PERSISTENT_SECTION));
        assert!(text.contains("boolean \"/bool\"=true"));
        assert!(text.contains("raw \"/raw\"=AAEC/w=="));
        let loaded = load(&buf[..], "mem").unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn missing_section_is_error() {
        let text = "boolean \"/a\"=true\n";
        assert!(matches!(
            load(text.as_bytes(), "mem"),
            Err(PersistError::MissingSection(_))
        ));
    }

    #[test]
    fn bad_lines_are_skipped() {
        let text = "; comment\n[NetworkTables Storage 3.0]\n\
                    boolean \"/a\"=maybe\n\
                    double \"/b\"=2\n\
                    widget \"/c\"=1\n\
                    string \"/d\"=unquoted\n\
                    array double \"/e\"=\n";
        let loaded = load(text.as_bytes(), "mem").unwrap();
        assert_eq!(
            loaded,
            vec![
                ("/b".to_string(), Value::Double(2.0)),
                ("/e".to_string(), Value::DoubleArray(vec![])),
            ]
        );
    }

    #[test]
    fn other_sections_are_ignored() {
        let text = "[Other]\nboolean \"/x\"=true\n[NetworkTables Storage 3.0]\ndouble \"/y\"=3\n";
        let loaded = load(text.as_bytes(), "mem").unwrap();
        assert_eq!(loaded, vec![("/y".to_string(), Value::Double(3.0))]);
    }

    #[test]
    fn escapes_round_trip() {
        let s = "tab\there \"q\" back\\slash \u{7f}";
        let esc = escape(s);
        assert!(!esc.contains('\t'));
        let (back, rest) = take_quoted(&format!("\"{}\"=", esc)).map(|(a, b)| (a, b.to_string())).unwrap();
        assert_eq!(back, s);
        assert_eq!(rest, "=");
    }

    #[test]
    fn atomic_save_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nt.ini");
        save_file(&path, &[("/a".into(), Value::Double(1.0))]).unwrap();
        save_file(&path, &[("/a".into(), Value::Double(2.0))]).unwrap();
        let current = load(io::BufReader::new(File::open(&path).unwrap()), "cur").unwrap();
        assert_eq!(current, vec![("/a".to_string(), Value::Double(2.0))]);
        let backup = load(
            io::BufReader::new(File::open(sibling(&path, ".bak")).unwrap()),
            "bak",
        )
        .unwrap();
        assert_eq!(backup, vec![("/a".to_string(), Value::Double(1.0))]);
        assert!(!sibling(&path, ".tmp").exists());
    }
}
