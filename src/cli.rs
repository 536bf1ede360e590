//! Command-line interfaces for the supervisor and the journalctl viewer.
use clap::Parser;

/// Flags accepted by the supervisor (init) entry point.
#[derive(Debug, Parser)]
#[command(name = "init", version)]
#[command(about = "A minimal service supervisor for containers", long_about = None)]
pub struct InitArgs {
    /// Mirror per-service log lines onto standard error.
    #[arg(long)]
    pub log_to_stderr: bool,

    /// Do not write per-service log files.
    #[arg(long)]
    pub no_logfile: bool,

    /// Skip the fork-tracking preload setup.
    #[arg(long)]
    pub no_pidtrack: bool,

    /// Log every reaper wait result.
    #[arg(long)]
    pub debug_reaper: bool,
}

/// Options for the journalctl entry point.
#[derive(Debug, Parser)]
#[command(name = "journalctl")]
#[command(about = "View service logs", long_about = None)]
pub struct JournalArgs {
    /// Only show entries at or after this time (format: 2012-10-30 18:17:16).
    #[arg(short = 'S', long)]
    pub since: Option<String>,

    /// Only show entries at or before this time.
    #[arg(short = 'U', long)]
    pub until: Option<String>,

    /// Only show entries since the last boot.
    #[arg(short = 'b', long)]
    pub boot: bool,

    /// Unit name.
    #[arg(short = 'u', long)]
    pub unit: Option<String>,

    /// Show at most this many trailing lines.
    #[arg(short = 'n', long, default_value_t = 0)]
    pub lines: usize,

    /// Follow the log as it grows; implies --lines.
    #[arg(short = 'f', long)]
    pub follow: bool,

    /// Do not page the output; implied by --follow.
    #[arg(long)]
    pub no_pager: bool,
}
