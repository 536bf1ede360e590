use std::{
    env, fs,
    io::{self, Write},
    os::unix::fs::symlink,
    path::Path,
    process,
};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use minisysd::{
    cli::{InitArgs, JournalArgs},
    control, journal, paths, supervisor,
};

/// One binary, several behaviours: the basename of `argv[0]` picks the mode,
/// except that PID 1 is always the supervisor.
fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let program = args
        .first()
        .map(|arg| {
            Path::new(arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    let mode = if process::id() == 1 {
        "init".to_string()
    } else {
        program
    };

    match mode.as_str() {
        "journalctl" => process::exit(journal::run(JournalArgs::parse())),
        "systemctl" => {
            if args.len() == 2 && args[1] == "version" {
                println!(env!("CARGO_PKG_VERSION"));
                return;
            }
            run_client(args[1..].to_vec());
        }
        "poweroff" | "shutdown" => run_client(vec!["poweroff".to_string()]),
        "service" => {
            // `service unit action` becomes `action unit`.
            let mut rest = args[1..].to_vec();
            if rest.len() >= 2 {
                rest.swap(0, 1);
            }
            run_client(rest);
        }
        _ => {
            let init_args = InitArgs::parse();
            info!("INIT: Booting <{}>", chrono::Local::now().to_rfc3339());
            install_multicall();
            if let Err(err) = supervisor::run(&init_args) {
                error!("supervisor failed: {err}");
                process::exit(1);
            }
        }
    }
}

fn run_client(args: Vec<String>) -> ! {
    let paths = paths::current();
    let mut stdout = io::stdout();
    match control::send_command(&paths, &args, &mut stdout) {
        Ok(code) => {
            let _ = stdout.flush();
            process::exit(code as i32);
        }
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Symlinks this executable under the client names in the first suitable
/// binary directory. Existing non-matching entries are renamed aside.
fn install_multicall() {
    let me = match env::current_exe() {
        Ok(me) => me,
        Err(err) => {
            warn!("Could not get executable name of self: {err}");
            return;
        }
    };
    let paths = paths::current();
    let suitable = [
        "usr/local/sbin",
        "usr/local/bin",
        "usr/bin",
        "bin",
        "usr/sbin",
        "sbin",
    ];
    let base = suitable
        .iter()
        .map(|dir| paths.root().join(dir))
        .find(|dir| dir.is_dir())
        .unwrap_or_else(|| paths.root().join("usr/sbin"));
    if let Err(err) = fs::create_dir_all(&base) {
        warn!("Could not create {}: {err}", base.display());
        return;
    }

    let names = [
        "journalctl",
        "systemctl",
        "systemd",
        "init",
        "poweroff",
        "shutdown",
        "service",
    ];
    for name in names {
        let dest = base.join(name);
        if dest == me {
            continue;
        }
        if fs::read_link(&dest).map(|link| link == me).unwrap_or(false) {
            continue;
        }
        if fs::symlink_metadata(&dest).is_ok() {
            let _ = fs::rename(&dest, dest.with_extension("old"));
        }
        info!("Linking {} => {}", me.display(), dest.display());
        if let Err(err) = symlink(&me, &dest) {
            error!("Could not link {} to {}: {err}", me.display(), dest.display());
        }
    }
}
