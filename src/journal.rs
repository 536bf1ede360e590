//! The journalctl log viewer.
//!
//! Runs client-side, outside the supervisor process, so plain child waits are
//! safe here. Tail-style queries delegate to `tail`; range queries scan the
//! file, filtering on the `YYYY-MM-DD HH:MM:SS` prefix the log writer stamps
//! on every line, and page through `less` (or `more`) on a terminal.

use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    path::Path,
    process::{Child, Command, Stdio},
};

use chrono::{DateTime, Local, NaiveDateTime};
use crossterm::tty::IsTty;

use crate::{
    cli::JournalArgs,
    paths::{self, LOG_TIME_FORMAT},
};

/// Runs the viewer and returns the process exit code.
pub fn run(args: JournalArgs) -> i32 {
    let paths = paths::current();
    let Some(unit) = args.unit.as_deref() else {
        eprintln!("ERR Unit name is required");
        return 1;
    };
    let log_file = paths.unit_log_file(unit);
    if !log_file.exists() {
        eprintln!("ERR Log file {} not accessible", log_file.display());
        return 1;
    }

    let mut since = match parse_bound(args.since.as_deref()) {
        Ok(bound) => bound,
        Err(err) => {
            eprintln!("ERR Wrong 'since' time format: {err}");
            return 1;
        }
    };
    let until = match parse_bound(args.until.as_deref()) {
        Ok(bound) => bound,
        Err(err) => {
            eprintln!("ERR Wrong 'until' time format: {err}");
            return 1;
        }
    };

    if args.boot
        && let Ok(raw) = fs::read_to_string(paths.boot_file())
        && let Ok(boot) = DateTime::parse_from_rfc3339(raw.trim())
    {
        let boot_local = boot.with_timezone(&Local).naive_local();
        if since.map(|bound| boot_local > bound).unwrap_or(true) {
            since = Some(boot_local);
        }
    }

    if args.follow {
        let lines = if args.lines == 0 { 10 } else { args.lines };
        return run_tail(&log_file, lines, true);
    }
    if args.lines > 0 {
        return run_tail(&log_file, args.lines, false);
    }

    scan(&log_file, since, until, args.no_pager)
}

fn parse_bound(raw: Option<&str>) -> Result<Option<NaiveDateTime>, chrono::ParseError> {
    match raw {
        Some(raw) => NaiveDateTime::parse_from_str(raw, LOG_TIME_FORMAT).map(Some),
        None => Ok(None),
    }
}

fn run_tail(log_file: &Path, lines: usize, follow: bool) -> i32 {
    let mut cmd = Command::new("tail");
    cmd.arg("-n").arg(lines.to_string());
    if follow {
        cmd.arg("-f");
    }
    cmd.arg(log_file);
    match cmd.status() {
        Ok(status) if status.success() => 0,
        _ => 1,
    }
}

fn scan(
    log_file: &Path,
    since: Option<NaiveDateTime>,
    until: Option<NaiveDateTime>,
    no_pager: bool,
) -> i32 {
    let file = match fs::File::open(log_file) {
        Ok(file) => file,
        Err(err) => {
            eprintln!(
                "ERR Cannot open log file {} for reading: {err}",
                log_file.display()
            );
            return 1;
        }
    };

    let mut pager = if no_pager { None } else { spawn_pager() };
    let mut out: Box<dyn Write> = match pager.as_mut().and_then(|child| child.stdin.take()) {
        Some(stdin) => Box::new(stdin),
        None => Box::new(io::stdout().lock()),
    };

    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if since.is_some() || until.is_some() {
            if line.len() < 19 {
                continue;
            }
            let Some(prefix) = line.get(0..19) else {
                continue;
            };
            match NaiveDateTime::parse_from_str(prefix, LOG_TIME_FORMAT) {
                Ok(stamp) => {
                    if let Some(since) = since
                        && stamp < since
                    {
                        continue;
                    }
                    if let Some(until) = until
                        && stamp > until
                    {
                        break;
                    }
                }
                Err(err) => {
                    eprintln!("TIME FORMAT ERROR ON LINE {line}: {err}");
                }
            }
        }
        if writeln!(out, "{line}").is_err() {
            // The pager went away; nothing left to show.
            break;
        }
    }
    drop(out);
    if let Some(mut child) = pager {
        let _ = child.wait();
    }
    0
}

fn spawn_pager() -> Option<Child> {
    if !io::stdout().is_tty() {
        return None;
    }
    let candidates: [(&str, &[&str]); 2] = [("less", &["-S", "-R"]), ("more", &["-R"])];
    for (pager, args) in candidates {
        if let Ok(child) = Command::new(pager)
            .args(args)
            .stdin(Stdio::piped())
            .spawn()
        {
            return Some(child);
        }
    }
    None
}
