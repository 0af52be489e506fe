//! Framed output log
//!
//! A process's combined stdout/stderr/stdin activity lives in one append-only
//! file made of self-describing records:
//!
//! ```text
//! <stream> <rfc3339-timestamp> <length>: <payload bytes>[\n]
//! ```
//!
//! The length prefix, not the trailing newline, is authoritative for where a
//! payload ends. That is what makes the log able to carry binary stdout
//! byte-for-byte: a payload may itself contain `\n` or NUL bytes and still
//! round-trip exactly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// Which byte stream a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    Stdin,
    SignalSent,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Stdin => "stdin",
            Stream::SignalSent => "signal-sent",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Stream::Stdout),
            "stderr" => Some(Stream::Stderr),
            "stdin" => Some(Stream::Stdin),
            "signal-sent" => Some(Stream::SignalSent),
            _ => None,
        }
    }
}

/// A single decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub stream: Stream,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Append-only writer for one process's log file.
///
/// Single-producer by contract: only the launcher that owns a process
/// directory ever writes to its `output.log`, so no locking is required here.
pub struct LogWriter {
    file: File,
}

impl LogWriter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("opening output log {}", path.as_ref().display()))?;
        Ok(Self { file })
    }

    /// Append one fully-formed record in a single write.
    pub fn append(&mut self, stream: Stream, payload: &[u8]) -> Result<()> {
        let ts = Utc::now();
        let mut record = Vec::with_capacity(payload.len() + 48);
        record.extend_from_slice(stream.as_str().as_bytes());
        record.push(b' ');
        record.extend_from_slice(ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true).as_bytes());
        record.push(b' ');
        record.extend_from_slice(payload.len().to_string().as_bytes());
        record.extend_from_slice(b": ");
        record.extend_from_slice(payload);
        if !payload.ends_with(b"\n") {
            record.push(b'\n');
        }

        self.file.write_all(&record).context("appending log record")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush().context("flushing output log")
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_data().context("fsyncing output log")
    }
}

/// The three streams a viewer typically wants, concatenated in file order.
#[derive(Debug, Default, Clone)]
pub struct Streams {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdin: Vec<u8>,
}

/// Read every well-formed record in the log, in file order.
///
/// Malformed records (a header that doesn't parse, a declared length that
/// runs past EOF) are skipped by scanning forward to the next `\n`; a
/// truncated final record never produces an error.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let mut file = File::open(path.as_ref())
        .with_context(|| format!("opening output log {}", path.as_ref().display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).context("reading output log")?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match parse_record_at(&buf, pos) {
            Some((record, next)) => {
                records.push(record);
                pos = next;
            }
            None => {
                // Skip to the next newline (or EOF) and try again.
                match buf[pos..].iter().position(|&b| b == b'\n') {
                    Some(off) => pos += off + 1,
                    None => break,
                }
            }
        }
    }
    Ok(records)
}

/// Parse one record starting at `pos`. Returns the record and the offset of
/// the next record on success.
fn parse_record_at(buf: &[u8], pos: usize) -> Option<(Record, usize)> {
    // The RFC3339 timestamp itself contains colons, so the header/payload
    // separator is ": " (colon-space) specifically, not the first colon.
    let sep_offset = buf[pos..].windows(2).position(|w| w == b": ")?;
    let header_end = pos + sep_offset;
    let header = std::str::from_utf8(&buf[pos..header_end]).ok()?;

    let mut parts = header.splitn(3, ' ');
    let stream = Stream::parse(parts.next()?)?;
    let ts_str = parts.next()?;
    let len_str = parts.next()?;

    let timestamp = DateTime::parse_from_rfc3339(ts_str).ok()?.with_timezone(&Utc);
    let len: usize = len_str.trim().parse().ok()?;

    // Header is "<stream> <ts> <len>:" then exactly one space before the payload.
    let payload_start = header_end + 2;
    let payload_end = payload_start.checked_add(len)?;
    if payload_end > buf.len() {
        return None;
    }
    let payload = buf[payload_start..payload_end].to_vec();

    // Consume the trailing separator newline if one was written.
    let mut next = payload_end;
    if !payload.ends_with(b"\n") && buf.get(next) == Some(&b'\n') {
        next += 1;
    }

    Some((
        Record {
            stream,
            timestamp,
            payload,
        },
        next,
    ))
}

/// Concatenate stdout, stderr, and stdin (with `signal-sent` folded into the
/// stdin sequence, prefixed human-readably) in file order.
pub fn read_all(path: impl AsRef<Path>) -> Result<Streams> {
    let mut out = Streams::default();
    for record in read_records(path)? {
        match record.stream {
            Stream::Stdout => out.stdout.extend_from_slice(&record.payload),
            Stream::Stderr => out.stderr.extend_from_slice(&record.payload),
            Stream::Stdin => out.stdin.extend_from_slice(&record.payload),
            Stream::SignalSent => {
                out.stdin.extend_from_slice(b"[signal] ");
                out.stdin.extend_from_slice(&record.payload);
                if !record.payload.ends_with(b"\n") {
                    out.stdin.push(b'\n');
                }
            }
        }
    }
    Ok(out)
}

/// Byte-exact stdout only.
pub fn read_raw_stdout(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in read_records(path)? {
        if record.stream == Stream::Stdout {
            out.extend_from_slice(&record.payload);
        }
    }
    Ok(out)
}

/// Stream records with a `BufReader` for large logs without loading the
/// whole file; used by viewers that only need to know whether any stdout
/// byte is non-text.
pub fn scan_stdout_prefix(path: impl AsRef<Path>, max_bytes: usize) -> Result<Vec<u8>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let mut out = Vec::new();
    for record in read_records_from_bytes(&buf) {
        if record.stream == Stream::Stdout {
            out.extend_from_slice(&record.payload);
            if out.len() >= max_bytes {
                out.truncate(max_bytes);
                break;
            }
        }
    }
    Ok(out)
}

fn read_records_from_bytes(buf: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match parse_record_at(buf, pos) {
            Some((record, next)) => {
                records.push(record);
                pos = next;
            }
            None => match buf[pos..].iter().position(|&b| b == b'\n') {
                Some(off) => pos += off + 1,
                None => break,
            },
        }
    }
    records
}
