//! The record source: parsed per-file revision histories.
//!
//! Histories are obtained by running `rlog` on each `,v` file and parsing
//! its output. Only this module knows the rlog format; everything downstream
//! consumes [ParsedRcsFile] records. Author and log text stay as raw bytes
//! here and are decoded later against the configured encodings.

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use chrono::NaiveDate;
use subprocess::Exec;
use subprocess::Redirection;

use crate::rcs::RevNum;

const REVISION_SEPARATOR: &[u8] = b"----------------------------";
const FILE_TERMINATOR: &[u8] =
    b"=============================================================================";

/// The rlog executable, overridable for unusual installations.
fn rlog_cmd() -> &'static String {
    static RLOG_CMD: OnceLock<String> = OnceLock::new();
    RLOG_CMD.get_or_init(|| env::var("RLOG").unwrap_or_else(|_| "rlog".to_string()))
}

#[derive(Debug, Clone)]
pub struct ParsedRcsFile {
    pub head: RevNum,
    /// The default branch, when the RCS file sets one (vendor imports).
    pub default_branch: Option<RevNum>,
    /// `symbolic names` entries in file order.
    pub symbols: Vec<(String, RevNum)>,
    pub revisions: Vec<ParsedRevision>,
}

#[derive(Debug, Clone)]
pub struct ParsedRevision {
    pub rev: RevNum,
    pub timestamp: i64,
    pub author: Vec<u8>,
    /// `state: dead`, the CVS way of recording a delete.
    pub dead: bool,
    /// The `lines: +a -d` counts, absent on initial revisions.
    pub lines: Option<(i64, i64)>,
    pub log: Vec<u8>,
}

/// Anything that can deliver a parsed history for an RCS file.
pub trait RecordSource {
    fn read(&mut self, rcs_path: &Path) -> Result<ParsedRcsFile>;
}

/// The default source: one `rlog` run per file.
#[derive(Debug, Default)]
pub struct RlogSource;

impl RecordSource for RlogSource {
    fn read(&mut self, rcs_path: &Path) -> Result<ParsedRcsFile> {
        let capture = Exec::cmd(rlog_cmd())
            .arg(rcs_path)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .with_context(|| format!("failed to run {}; are the RCS tools installed?", rlog_cmd()))?;
        if !capture.exit_status.success() {
            bail!(
                "{} failed on {}: {}",
                rlog_cmd(),
                rcs_path.display(),
                capture.stderr_str().trim()
            );
        }
        parse_rlog(&capture.stdout)
            .with_context(|| format!("could not parse rlog output for {}", rcs_path.display()))
    }
}

/// Parse one file's worth of rlog output.
pub fn parse_rlog(output: &[u8]) -> Result<ParsedRcsFile> {
    let mut lines = output.split(|&b| b == b'\n').map(trim_cr).peekable();

    let mut head = None;
    let mut default_branch = None;
    let mut symbols = Vec::new();

    // Header section, up to the first revision separator.
    while let Some(line) = lines.next() {
        if line == REVISION_SEPARATOR || line == FILE_TERMINATOR {
            break;
        }
        if let Some(value) = field(line, b"head: ") {
            head = Some(parse_rev(value)?);
        } else if let Some(value) = field(line, b"branch: ") {
            if !value.is_empty() {
                default_branch = Some(parse_rev(value)?);
            }
        } else if line == b"symbolic names:" {
            while lines.peek().is_some_and(|l| l.starts_with(b"\t") || l.starts_with(b" ")) {
                let entry = lines.next().unwrap();
                let entry = String::from_utf8_lossy(entry);
                let entry = entry.trim();
                let (name, num) = entry
                    .split_once(':')
                    .with_context(|| format!("malformed symbolic name entry: {:?}", entry))?;
                symbols.push((name.trim().to_string(), num.trim().parse()?));
            }
        }
    }

    let head = head.context("rlog output has no head revision")?;

    // Revision blocks.
    let mut revisions = Vec::new();
    while lines.peek().is_some() {
        let Some(rev_line) = lines.next() else { break };
        if rev_line.is_empty() || rev_line == FILE_TERMINATOR {
            continue;
        }
        let rev_text = field(rev_line, b"revision ")
            .with_context(|| format!("expected a revision line, got {:?}", printable(rev_line)))?;
        // A "locked by" annotation may trail the number.
        let rev_text = rev_text.split(|&b| b == b'\t' || b == b' ').next().unwrap();
        let rev = parse_rev(rev_text)?;

        let date_line = lines.next().context("revision block ends before its date line")?;
        let (timestamp, author, dead, lines_changed) = parse_date_line(date_line)?;

        // An optional "branches:" line precedes the log proper.
        if lines.peek().is_some_and(|l| l.starts_with(b"branches:")) {
            lines.next();
        }

        let mut log: Vec<u8> = Vec::new();
        let mut terminated = false;
        for line in lines.by_ref() {
            if line == REVISION_SEPARATOR {
                break;
            }
            if line == FILE_TERMINATOR {
                terminated = true;
                break;
            }
            log.extend_from_slice(line);
            log.push(b'\n');
        }

        revisions.push(ParsedRevision { rev, timestamp, author, dead, lines: lines_changed, log });
        if terminated {
            break;
        }
    }

    Ok(ParsedRcsFile { head, default_branch, symbols, revisions })
}

/// Parse `date: ...;  author: ...;  state: ...;  lines: +a -d` fields.
fn parse_date_line(line: &[u8]) -> Result<(i64, Vec<u8>, bool, Option<(i64, i64)>)> {
    let mut timestamp = None;
    let mut author = None;
    let mut dead = false;
    let mut lines_changed = None;

    for part in line.split(|&b| b == b';') {
        let part = trim_ascii(part);
        if let Some(value) = field(part, b"date: ") {
            timestamp = Some(parse_date(&String::from_utf8_lossy(value))?);
        } else if let Some(value) = field(part, b"author: ") {
            author = Some(value.to_vec());
        } else if let Some(value) = field(part, b"state: ") {
            dead = value == b"dead";
        } else if let Some(value) = field(part, b"lines: ") {
            lines_changed = parse_lines(&String::from_utf8_lossy(value));
        }
    }

    Ok((
        timestamp.with_context(|| format!("missing date in {:?}", printable(line)))?,
        author.unwrap_or_default(),
        dead,
        lines_changed,
    ))
}

/// Accepts both RCS date spellings: `2003/02/11 14:21:03` and
/// `2003-02-11 14:21:03 +0000`. Two-digit years are pre-2000.
fn parse_date(text: &str) -> Result<i64> {
    let mut parts = text.split_whitespace();
    let date = parts.next().context("empty date")?;
    let time = parts.next().context("date has no time component")?;
    let offset = parts.next();

    let sep = if date.contains('/') { '/' } else { '-' };
    let mut date_parts = date.split(sep);
    let mut year: i32 = date_parts.next().context("bad date")?.parse()?;
    let month: u32 = date_parts.next().context("bad date")?.parse()?;
    let day: u32 = date_parts.next().context("bad date")?.parse()?;
    if year < 100 {
        year += 1900;
    }

    let mut time_parts = time.split(':');
    let hour: u32 = time_parts.next().context("bad time")?.parse()?;
    let minute: u32 = time_parts.next().context("bad time")?.parse()?;
    let second: u32 = time_parts.next().context("bad time")?.parse()?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .with_context(|| format!("date out of range: {:?}", text))?;
    let mut timestamp = naive.and_utc().timestamp();

    if let Some(offset) = offset {
        let (sign, digits) = if let Some(d) = offset.strip_prefix('+') {
            (1, d)
        } else if let Some(d) = offset.strip_prefix('-') {
            (-1, d)
        } else {
            bail!("malformed timezone offset: {:?}", offset)
        };
        if digits.len() != 4 {
            bail!("malformed timezone offset: {:?}", offset);
        }
        let hours: i64 = digits[..2].parse()?;
        let minutes: i64 = digits[2..].parse()?;
        timestamp -= sign * (hours * 3600 + minutes * 60);
    }

    Ok(timestamp)
}

fn parse_lines(text: &str) -> Option<(i64, i64)> {
    let mut parts = text.split_whitespace();
    let added = parts.next()?.parse().ok()?;
    let deleted = parts.next()?.parse().ok()?;
    Some((added, deleted))
}

fn parse_rev(bytes: &[u8]) -> Result<RevNum> {
    String::from_utf8_lossy(bytes).parse()
}

fn field<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    line.strip_prefix(prefix).map(trim_ascii)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
RCS file: /cvsroot/proj/foo.c,v
Working file: foo.c
head: 1.3
branch: 1.1.1
locks: strict
access list:
symbolic names:
\tREL_1: 1.2
\tSTABLE: 1.2.0.2
\tVENDOR: 1.1.1
keyword substitution: kv
total revisions: 4;\tselected revisions: 4
description:
----------------------------
revision 1.3
date: 2003/02/12 10:00:00;  author: fitzgen;  state: dead;  lines: +0 -12
removed again
----------------------------
revision 1.2
date: 2003/02/11 14:21:03;  author: jrandom;  state: Exp;  lines: +2 -1
branches:  1.2.2;
two line
log message
----------------------------
revision 1.1
date: 2003-02-10 09:00:00 +0100;  author: jrandom;  state: Exp
Initial revision
=============================================================================
";

    #[test]
    fn parses_header() {
        let parsed = parse_rlog(SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.head, "1.3".parse().unwrap());
        assert_eq!(parsed.default_branch, Some("1.1.1".parse().unwrap()));
        assert_eq!(parsed.symbols.len(), 3);
        assert_eq!(parsed.symbols[1].0, "STABLE");
        assert_eq!(parsed.symbols[1].1, "1.2.0.2".parse().unwrap());
    }

    #[test]
    fn parses_revision_blocks() {
        let parsed = parse_rlog(SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.revisions.len(), 3);

        let r3 = &parsed.revisions[0];
        assert!(r3.dead);
        assert_eq!(r3.lines, Some((0, -12)));
        assert_eq!(r3.log, b"removed again\n");

        let r2 = &parsed.revisions[1];
        assert_eq!(r2.author, b"jrandom");
        assert!(!r2.dead);
        // The branches line is not part of the log.
        assert_eq!(r2.log, b"two line\nlog message\n");

        let r1 = &parsed.revisions[2];
        assert_eq!(r1.lines, None);
        assert_eq!(r1.log, b"Initial revision\n");
    }

    #[test]
    fn date_formats() {
        assert_eq!(parse_date("2003/02/11 14:21:03").unwrap(), 1044973263);
        // Offset form: 10:00 +0100 is 09:00 UTC.
        assert_eq!(
            parse_date("2003-02-11 10:00:00 +0100").unwrap(),
            parse_date("2003/02/11 09:00:00").unwrap()
        );
        // Two-digit years are 19xx.
        assert_eq!(parse_date("98/01/01 00:00:00").unwrap(), parse_date("1998/01/01 00:00:00").unwrap());
    }

    #[test]
    fn missing_head_is_an_error() {
        assert!(parse_rlog(b"RCS file: x\n").is_err());
    }
}
