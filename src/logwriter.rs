//! Per-service log files.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::fs::OpenOptionsExt,
    sync::{Arc, Mutex},
    thread,
};

use chrono::Local;

use crate::{
    paths::{LOG_TIME_FORMAT, Paths},
    supervisor::SupervisorOptions,
};

/// Appends a unit's output to `{logdir}/{unit}.log`, one timestamped line at
/// a time, optionally mirroring each line to the supervisor's stderr.
pub struct LogWriter {
    unit: String,
    file: Option<Mutex<File>>,
    mirror_stderr: bool,
}

impl LogWriter {
    /// Opens (creating if needed) the unit's log file in append mode.
    pub fn open(paths: &Paths, unit: &str, options: &SupervisorOptions) -> io::Result<Arc<Self>> {
        let file = if options.log_to_file {
            let path = paths.unit_log_file(unit);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o644)
                .open(&path)?;
            Some(Mutex::new(file))
        } else {
            None
        };
        Ok(Arc::new(Self {
            unit: unit.to_string(),
            file,
            mirror_stderr: options.log_to_stderr,
        }))
    }

    /// Appends one output line, stamped with the local time.
    pub fn log_line(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if self.mirror_stderr && !line.is_empty() {
            eprintln!("<{}> {line}", self.unit);
        }
        if let Some(file) = &self.file {
            let stamp = Local::now().format(LOG_TIME_FORMAT);
            let mut file = file.lock().unwrap_or_else(|err| err.into_inner());
            let _ = writeln!(file, "{stamp} {line}");
        }
    }
}

/// Pumps a child stdio stream into the writer until EOF.
pub fn spawn_copier<R>(writer: Arc<LogWriter>, stream: R) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => writer.log_line(&line),
                Err(_) => break,
            }
        }
    })
}
