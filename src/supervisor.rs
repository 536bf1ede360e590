//! The init-mode supervisor: shared context, boot sequence, control loop and
//! shutdown.

use std::{
    fs,
    io::{self, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use chrono::Local;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{error, info, warn};

use crate::{
    cli::InitArgs,
    command, control,
    graph::UnitGraph,
    paths::{self, Paths},
    pidtrack::{self, ForkTracker},
    reaper::Reaper,
    unit::UnitState,
};

/// Behaviour toggles from the supervisor command line.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Mirror per-service log lines onto the supervisor's stderr.
    pub log_to_stderr: bool,
    /// Write per-service log files.
    pub log_to_file: bool,
    /// Install the preload library and serve the tracker socket.
    pub pid_tracking: bool,
    /// Log every reaper wait result.
    pub debug_reaper: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            log_to_stderr: false,
            log_to_file: true,
            pid_tracking: true,
            debug_reaper: false,
        }
    }
}

impl From<&InitArgs> for SupervisorOptions {
    fn from(args: &InitArgs) -> Self {
        Self {
            log_to_stderr: args.log_to_stderr,
            log_to_file: !args.no_logfile,
            pid_tracking: !args.no_pidtrack,
            debug_reaper: args.debug_reaper,
        }
    }
}

/// Everything one supervisor instance shares: the path layout, the unit
/// graph, the reaper, the fork tracker and the option set. Threaded through
/// the dispatcher and every lifecycle call.
pub struct Context {
    pub paths: Paths,
    pub graph: UnitGraph,
    pub reaper: Arc<Reaper>,
    pub tracker: Arc<ForkTracker>,
    pub options: SupervisorOptions,
}

impl Context {
    /// Builds a context against the current path root and starts the reaper.
    pub fn new(options: SupervisorOptions) -> Arc<Self> {
        let reaper = Reaper::new(options.debug_reaper);
        reaper.spawn();
        Arc::new(Self {
            paths: paths::current(),
            graph: UnitGraph::new(),
            reaper,
            tracker: ForkTracker::new(),
            options,
        })
    }

    /// Reloads units, then starts everything the boot target wants.
    pub fn load_and_start(self: &Arc<Self>) {
        self.graph.reload(&self.paths);
        let Ok(entries) = fs::read_dir(self.paths.wants_dir()) else {
            return;
        };
        let mut wanted: Vec<String> = entries
            .flatten()
            .filter(|entry| !entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".service")
                    .map(|base| base.to_string())
            })
            .collect();
        wanted.sort();
        for name in wanted {
            let Some(unit) = self.graph.get(&name) else {
                warn!("INIT: Wanted target service not found: {name}");
                continue;
            };
            info!("INIT: Starting: {name}");
            match unit.start(self) {
                Ok(()) => info!("INIT: Started: {name}"),
                Err(err) => warn!("INIT: Failed to start {name}: {err}"),
            }
        }
    }

    /// Stops every unit that is not already stopped or stopping.
    pub fn stop_all(self: &Arc<Self>) {
        for name in self.graph.list() {
            let Some(unit) = self.graph.get(&name) else {
                continue;
            };
            let state = unit.state();
            if state == UnitState::Stopped || state == UnitState::Stopping {
                continue;
            }
            info!("SHUTDOWN: Stopping: {name}");
            match unit.stop(self) {
                Ok(()) => info!("SHUTDOWN: Stopped: {name}"),
                Err(err) => warn!("SHUTDOWN: Failed to stop {name}: {err}"),
            }
        }
    }
}

/// Runs the supervisor until a termination signal arrives.
pub fn run(args: &InitArgs) -> io::Result<()> {
    let ctx = Context::new(SupervisorOptions::from(args));

    fs::create_dir_all(ctx.paths.log_dir())?;
    write_boot_file(&ctx.paths)?;

    if ctx.options.pid_tracking {
        info!("INIT: Creating pidtrack socket");
        if let Err(err) = pidtrack::install_preload(&ctx.paths, true) {
            warn!("INIT: Could not install preload library: {err}");
        }
        if let Err(err) = ctx.tracker.listen(&ctx.paths.tracker_socket()) {
            warn!(
                "INIT: ERROR: Could not create pidtrack socket, will not fully track forking processes: {err}"
            );
        }
    } else if let Err(err) = pidtrack::install_preload(&ctx.paths, false) {
        warn!("INIT: Could not install preload shim: {err}");
    }

    info!("INIT: Creating control socket");
    let socket_path = ctx.paths.control_socket();
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    let shutdown_ctx = Arc::clone(&ctx);
    ctrlc::set_handler(move || shutdown(&shutdown_ctx)).map_err(io::Error::other)?;

    let start_ctx = Arc::clone(&ctx);
    thread::spawn(move || {
        info!("INIT: Starting services");
        start_ctx.load_and_start();
        info!("INIT: Complete");
    });

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || handle_connection(ctx, stream));
            }
            Err(err) => {
                error!("control socket accept failed: {err}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    Ok(())
}

static SHUTDOWN_LOCK: Mutex<()> = Mutex::new(());

fn shutdown(ctx: &Arc<Context>) {
    let _guard = SHUTDOWN_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    info!("SHUTDOWN: Signal received");
    let _ = fs::remove_file(ctx.paths.control_socket());
    info!("SHUTDOWN: Stopping services");
    ctx.stop_all();
    info!("SHUTDOWN: Reaping processes");
    ctx.reaper.final_reap();
    info!("SHUTDOWN: Complete");
    std::process::exit(0);
}

/// Serves one control connection: frame in, dispatch, stream out, trailer.
pub fn handle_connection(ctx: Arc<Context>, mut stream: UnixStream) {
    let args = match control::read_frame(&mut stream) {
        Ok(args) => args,
        Err(err) => {
            warn!("invalid control frame: {err}");
            return;
        }
    };
    let outcome = command::dispatch(&ctx, &args, &mut stream);
    let _ = stream.flush();
    if let Err(err) = control::finish_response(&mut stream, outcome.code) {
        warn!("control response failed: {err}");
    }
    if outcome.poweroff {
        let _ = signal::kill(Pid::this(), Signal::SIGTERM);
    }
}

fn write_boot_file(paths: &Paths) -> io::Result<()> {
    let boot_file = paths.boot_file();
    if let Some(parent) = boot_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(boot_file, Local::now().to_rfc3339())
}
