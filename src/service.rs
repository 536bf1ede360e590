//! Per-unit lifecycle: start, stop, restart, reload, and the monitor that
//! applies the restart policy.

use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    os::unix::{fs::symlink, process::CommandExt},
    path::Path,
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::{Gid, Group, Pid, Uid, User},
};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

use crate::{
    error::UnitError,
    logwriter::{LogWriter, spawn_copier},
    reaper::{CommandHandle, ReapStatus, process_alive},
    supervisor::Context,
    unit::{RelationKind, RestartPolicy, Unit, UnitDef, UnitState},
};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESTART_SLEEP: Duration = Duration::from_secs(1);
const PIDFILE_WAIT: Duration = Duration::from_secs(5);
const PIDFILE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const UNNEEDED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable marking a process as belonging to a service.
pub const ENV_MARKER: &str = "SYSTEMD_SERVICE_NAME";

/// Splits the leading `-` that marks a line's failure as tolerable.
fn split_tolerant(line: &str) -> (bool, &str) {
    match line.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, line),
    }
}

type EnvMap = BTreeMap<String, String>;

fn parse_env_entries(entries: &[String]) -> EnvMap {
    let mut env = EnvMap::new();
    for entry in entries {
        if let Some((key, value)) = entry.split_once('=')
            && !key.is_empty()
        {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}

/// Builds a `/bin/bash -c <line>` command. `env` of `None` inherits the
/// supervisor's environment; `Some` replaces it wholesale.
fn build_command(
    line: &str,
    env: Option<&EnvMap>,
    marker: Option<&str>,
    cwd: Option<&Path>,
) -> Command {
    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-c").arg(line);
    if let Some(env) = env {
        cmd.env_clear();
        cmd.envs(env);
    }
    if let Some(name) = marker {
        cmd.env(ENV_MARKER, name);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

impl Unit {
    /// Starts the unit as a direct request, resolving relations first.
    pub fn start(self: &Arc<Self>, ctx: &Arc<Context>) -> Result<(), UnitError> {
        let _op = self.lock_op();
        self.start_locked(ctx, true)
    }

    /// Start procedure; the caller holds the operation lock.
    pub(crate) fn start_locked(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        manual: bool,
    ) -> Result<(), UnitError> {
        info!("START: {} Starting", self.name());
        let result = self.start_inner(ctx, manual);
        info!("START: {} Done", self.name());
        result
    }

    fn start_inner(self: &Arc<Self>, ctx: &Arc<Context>, manual: bool) -> Result<(), UnitError> {
        let def = {
            let mut inner = self.write();
            if inner.masked {
                return Err(UnitError::Masked);
            }
            let Some(def) = inner.def.clone() else {
                return Err(UnitError::Removed);
            };
            if manual {
                inner.manual = true;
            }
            if inner.state == UnitState::Running {
                return Ok(());
            }
            if inner.state != UnitState::Restarting {
                inner.state = UnitState::Starting;
            }
            def
        };

        for (key, value) in &def.limits {
            warn!(
                "<{}> WARNING: {key}={value} specified in service file, cannot be applied here",
                self.name()
            );
        }

        // Clear stale command handles from a previous run.
        if let Err(err) = self.stop_inner(ctx) {
            return Err(self.abort_start(ctx, err, false));
        }
        self.write().state_error = None;

        // Merged environment: Environment= entries then EnvironmentFile contents.
        let mut env_entries = def.environment.clone();
        for raw in &def.environment_files {
            let (optional, path) = split_tolerant(raw);
            match fs::read_to_string(path) {
                Ok(contents) => {
                    env_entries.extend(contents.lines().map(|line| line.to_string()));
                }
                Err(_) if optional => {}
                Err(source) => {
                    let err = UnitError::EnvFile {
                        path: path.to_string(),
                        source,
                    };
                    return Err(self.abort_start(ctx, err, false));
                }
            }
        }
        let env = parse_env_entries(&env_entries);

        // Credentials.
        let mut uid: Option<u32> = None;
        let mut gid: Option<u32> = None;
        if let Some(name) = &def.user {
            match User::from_name(name) {
                Ok(Some(user)) => {
                    uid = Some(user.uid.as_raw());
                    gid = Some(user.gid.as_raw());
                }
                _ => {
                    let err = UnitError::Credential {
                        kind: "user",
                        name: name.clone(),
                    };
                    return Err(self.abort_start(ctx, err, false));
                }
            }
        }
        if let Some(name) = &def.group {
            match Group::from_name(name) {
                Ok(Some(group)) => {
                    gid = Some(group.gid.as_raw());
                    if uid.is_none() {
                        uid = Some(Uid::effective().as_raw());
                    }
                }
                _ => {
                    let err = UnitError::Credential {
                        kind: "group",
                        name: name.clone(),
                    };
                    return Err(self.abort_start(ctx, err, false));
                }
            }
        }

        let writer = match LogWriter::open(&ctx.paths, self.name(), &ctx.options) {
            Ok(writer) => writer,
            Err(err) => {
                return Err(self.abort_start(ctx, UnitError::LogFile(err), false));
            }
        };

        // Conditions: a non-zero exit is a clean no-start, not a failure.
        for line in &def.exec_condition {
            let met = self
                .run_hook(ctx, &writer, Some(&env), None, line)
                .map(|status| status.success())
                .unwrap_or(false);
            if !met {
                info!("<{}> Condition {line} not met", self.name());
                let mut inner = self.write();
                inner.state = UnitState::Stopped;
                inner.state_error = None;
                return Ok(());
            }
        }

        // Relations.
        for dep in def.relations.get(RelationKind::Requisite) {
            let running = ctx
                .graph
                .get(dep)
                .map(|unit| unit.state() == UnitState::Running)
                .unwrap_or(false);
            if !running {
                warn!("<{}> Dependency {dep} not running, aborting", self.name());
                let err = UnitError::Dependency {
                    dependency: dep.clone(),
                    reason: "dependency not running".to_string(),
                };
                return Err(self.abort_start(ctx, err, true));
            }
        }
        let hard_deps = def
            .relations
            .get(RelationKind::Requires)
            .iter()
            .chain(def.relations.get(RelationKind::BindsTo));
        for dep in hard_deps {
            if let Err(err) = self.start_dependency(ctx, dep) {
                warn!(
                    "<{}> Dependency {dep} start failed, aborting: {err}",
                    self.name()
                );
                let err = UnitError::Dependency {
                    dependency: dep.clone(),
                    reason: err.to_string(),
                };
                return Err(self.abort_start(ctx, err, true));
            }
        }
        let soft_deps = def
            .relations
            .get(RelationKind::Wants)
            .iter()
            .chain(def.relations.get(RelationKind::Upholds));
        for dep in soft_deps {
            if let Err(err) = self.start_dependency(ctx, dep) {
                warn!("<{}> Dependency {dep} start failed: {err}", self.name());
            }
        }
        for dep in def.relations.get(RelationKind::Conflicts) {
            let Some(unit) = ctx.graph.get(dep) else { continue };
            if Arc::ptr_eq(&unit, self) {
                continue;
            }
            if let Err(err) = unit.stop(ctx) {
                warn!(
                    "<{}> Dependency {dep} stop failed, aborting: {err}",
                    self.name()
                );
                let err = UnitError::Dependency {
                    dependency: dep.clone(),
                    reason: err.to_string(),
                };
                return Err(self.abort_start(ctx, err, true));
            }
        }

        // ExecStartPre.
        self.run_exec_list(ctx, &writer, &env, &def.exec_start_pre)?;

        // ExecStart.
        let mut handles: Vec<CommandHandle> = Vec::new();
        for raw in &def.exec_start {
            let (tolerate, line) = split_tolerant(raw);
            let mut cmd = build_command(
                line,
                Some(&env),
                Some(self.name()),
                def.working_directory.as_deref(),
            );
            if let Some(uid) = uid
                && uid != 0
            {
                cmd.uid(uid);
                cmd.gid(gid.unwrap_or(Gid::effective().as_raw()));
            }
            match ctx.reaper.launch(cmd) {
                Ok((handle, mut child)) => {
                    if let Some(stdout) = child.stdout.take() {
                        spawn_copier(writer.clone(), stdout);
                    }
                    if let Some(stderr) = child.stderr.take() {
                        spawn_copier(writer.clone(), stderr);
                    }
                    handles.push(handle);
                }
                Err(source) => {
                    let err = UnitError::Launch {
                        line: line.to_string(),
                        source,
                    };
                    warn!("<{}> Failed: {line}: {err}", self.name());
                    if !tolerate {
                        let _ = self.stop_inner(ctx);
                        return Err(self.abort_start(ctx, err, true));
                    }
                }
            }
        }

        // ExecStartPost.
        self.run_exec_list(ctx, &writer, &env, &def.exec_start_post)?;

        {
            let mut inner = self.write();
            inner.state = UnitState::Running;
            inner.state_error = None;
            inner.commands = handles;
        }
        self.run_launch_list(ctx, RelationKind::OnSuccess);
        spawn_monitor(ctx, self, def);
        Ok(())
    }

    /// Runs one run-to-completion `Exec*` list with the `-` convention; a
    /// fail-significant failure aborts the start.
    fn run_exec_list(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        writer: &Arc<LogWriter>,
        env: &EnvMap,
        lines: &[String],
    ) -> Result<(), UnitError> {
        for raw in lines {
            let (tolerate, line) = split_tolerant(raw);
            let outcome = self.run_hook(ctx, writer, Some(env), None, line);
            let err = match outcome {
                Ok(status) if status.success() => continue,
                Ok(status) => UnitError::Exec {
                    line: line.to_string(),
                    code: status.code,
                },
                Err(err) => err,
            };
            warn!("<{}> Failed: {line}: {err}", self.name());
            if !tolerate {
                let _ = self.stop_inner(ctx);
                return Err(self.abort_start(ctx, err, true));
            }
        }
        Ok(())
    }

    /// Spawns one command line through the reaper and waits it out.
    fn run_hook(
        &self,
        ctx: &Arc<Context>,
        writer: &Arc<LogWriter>,
        env: Option<&EnvMap>,
        cwd: Option<&Path>,
        line: &str,
    ) -> Result<ReapStatus, UnitError> {
        let cmd = build_command(line, env, None, cwd);
        let (handle, mut child) = ctx.reaper.launch(cmd).map_err(|source| UnitError::Launch {
            line: line.to_string(),
            source,
        })?;
        if let Some(stdout) = child.stdout.take() {
            spawn_copier(writer.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_copier(writer.clone(), stderr);
        }
        drop(child);
        Ok(handle.wait())
    }

    /// Records the failure, lands in Stopped, and optionally fires OnFailure.
    fn abort_start(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        err: UnitError,
        fire_on_failure: bool,
    ) -> UnitError {
        {
            let mut inner = self.write();
            inner.state = UnitState::Stopped;
            inner.state_error = Some(err.to_string());
        }
        if fire_on_failure {
            self.run_launch_list(ctx, RelationKind::OnFailure);
        }
        err
    }

    /// Starts a dependency, skipping neighbours already Running or Starting
    /// so relation cycles terminate.
    fn start_dependency(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        name: &str,
    ) -> Result<(), UnitError> {
        let Some(dep) = ctx.graph.get(name) else {
            debug!("dependency {name} not loaded; skipping");
            return Ok(());
        };
        if Arc::ptr_eq(&dep, self) {
            return Ok(());
        }
        match dep.state() {
            UnitState::Running | UnitState::Starting => Ok(()),
            _ => {
                let _op = dep.lock_op();
                dep.start_locked(ctx, false)
            }
        }
    }

    /// Fires the units named by OnFailure or OnSuccess.
    fn run_launch_list(self: &Arc<Self>, ctx: &Arc<Context>, kind: RelationKind) {
        let targets: Vec<String> = {
            let inner = self.read();
            match &inner.def {
                Some(def) => def.relations.get(kind).iter().cloned().collect(),
                None => return,
            }
        };
        for name in targets {
            let Some(unit) = ctx.graph.get(&name) else { continue };
            if Arc::ptr_eq(&unit, self) {
                continue;
            }
            let result = {
                let _op = unit.lock_op();
                unit.start_locked(ctx, false)
            };
            if let Err(err) = result {
                warn!(
                    "<{}> {kind:?} dependency {name} start failed: {err}",
                    self.name()
                );
            }
        }
    }

    /// Stops the unit: stop hooks, SIGTERM, poll, SIGKILL fallback.
    pub fn stop(self: &Arc<Self>, ctx: &Arc<Context>) -> Result<(), UnitError> {
        let _op = self.lock_op();
        info!("STOP: {} Stopping", self.name());
        let result = self.stop_inner(ctx);
        info!("STOP: {} Done", self.name());
        result
    }

    fn stop_inner(self: &Arc<Self>, ctx: &Arc<Context>) -> Result<(), UnitError> {
        let def = {
            let mut inner = self.write();
            if inner.masked {
                return Err(UnitError::Masked);
            }
            if inner.state != UnitState::Restarting {
                inner.state = UnitState::Stopping;
            }
            inner.def.clone().unwrap_or_default()
        };
        let writer = match LogWriter::open(&ctx.paths, self.name(), &ctx.options) {
            Ok(writer) => writer,
            Err(err) => {
                let err = UnitError::LogFile(err);
                self.write().state_error = Some(err.to_string());
                return Err(err);
            }
        };

        // Stop hooks run with the supervisor's own environment; errors are
        // recorded but never abort the stop.
        self.run_stop_hooks(ctx, &writer, &def.exec_stop_pre, None, "StopPre");
        self.run_stop_hooks(
            ctx,
            &writer,
            &def.exec_stop,
            def.working_directory.as_deref(),
            "Stop",
        );
        self.run_stop_hooks(ctx, &writer, &def.exec_stop_post, None, "StopPost");

        let pids: Vec<libc::pid_t> = {
            let inner = self.read();
            inner.commands.iter().map(|handle| handle.pid()).collect()
        };
        for pid in &pids {
            info!("Sending SIGTERM to {pid}");
            let _ = signal::kill(Pid::from_raw(*pid), Signal::SIGTERM);
        }

        let timeout = def
            .stop_timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(DEFAULT_STOP_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let mut all_exited;
        loop {
            thread::sleep(STOP_POLL_INTERVAL);
            all_exited = pids.iter().all(|pid| !process_alive(*pid));
            if all_exited || Instant::now() >= deadline {
                break;
            }
        }
        if !all_exited {
            for pid in &pids {
                let _ = signal::kill(Pid::from_raw(*pid), Signal::SIGKILL);
            }
            self.write().state_error = Some(UnitError::TimeoutFallback.to_string());
        }

        let mut inner = self.write();
        inner.commands.clear();
        inner.state = UnitState::Stopped;
        Ok(())
    }

    fn run_stop_hooks(
        self: &Arc<Self>,
        ctx: &Arc<Context>,
        writer: &Arc<LogWriter>,
        lines: &[String],
        cwd: Option<&Path>,
        phase: &str,
    ) {
        for raw in lines {
            let (_, line) = split_tolerant(raw);
            let outcome = self.run_hook(ctx, writer, None, cwd, line);
            let err = match outcome {
                Ok(status) if status.success() => continue,
                Ok(status) => UnitError::Exec {
                    line: line.to_string(),
                    code: status.code,
                },
                Err(err) => err,
            };
            warn!(
                "<{}> Failed to run {phase} action ({line}): {err}",
                self.name()
            );
            self.write().state_error = Some(format!("Failed {phase}: {line}: {err}"));
        }
    }

    /// Stop followed by start, passing through Restarting.
    pub fn restart(self: &Arc<Self>, ctx: &Arc<Context>) -> Result<(), UnitError> {
        let _op = self.lock_op();
        {
            let mut inner = self.write();
            if inner.masked {
                return Err(UnitError::Masked);
            }
            inner.state = UnitState::Restarting;
        }
        self.stop_inner(ctx)?;
        self.start_locked(ctx, true)
    }

    /// Runs `ExecReload` if configured, otherwise SIGHUPs every command.
    pub fn reload(self: &Arc<Self>, ctx: &Arc<Context>) -> Result<(), UnitError> {
        let _op = self.lock_op();
        let (def, pids) = {
            let inner = self.read();
            if inner.masked {
                return Err(UnitError::Masked);
            }
            let pids: Vec<libc::pid_t> =
                inner.commands.iter().map(|handle| handle.pid()).collect();
            (inner.def.clone().unwrap_or_default(), pids)
        };
        match &def.exec_reload {
            Some(line) if !line.is_empty() => {
                let mut cmd = Command::new("/bin/bash");
                cmd.arg("-c").arg(line);
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
                let (handle, mut child) =
                    ctx.reaper.launch(cmd).map_err(|source| UnitError::Launch {
                        line: line.clone(),
                        source,
                    })?;
                let stdout = child.stdout.take().map(collect_stream);
                let stderr = child.stderr.take().map(collect_stream);
                drop(child);
                let status = handle.wait();
                if !status.success() {
                    let mut output = String::new();
                    if let Some(thread) = stdout {
                        output.push_str(&thread.join().unwrap_or_default());
                    }
                    if let Some(thread) = stderr {
                        output.push_str(&thread.join().unwrap_or_default());
                    }
                    return Err(UnitError::Reload {
                        output: format!("exit status {}: {}", status.code, output.trim()),
                    });
                }
            }
            _ => {
                for pid in pids {
                    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGHUP);
                }
            }
        }
        Ok(())
    }

    /// True when the enable marker for this unit exists.
    pub fn is_enabled(&self, ctx: &Context) -> bool {
        if self.read().def.is_none() {
            return false;
        }
        ctx.paths
            .wants_dir()
            .join(format!("{}.service", self.name()))
            .exists()
    }

    /// Creates the enable marker under the wants directory.
    pub fn enable(&self, ctx: &Context) -> Result<(), UnitError> {
        let _op = self.lock_op();
        {
            let inner = self.read();
            if inner.def.is_none() {
                return Err(UnitError::Removed);
            }
            if inner.source_paths.is_empty() {
                return Err(UnitError::NoSourcePath);
            }
        }
        let wants = ctx.paths.wants_dir();
        fs::create_dir_all(&wants)?;
        let marker = wants.join(format!("{}.service", self.name()));
        if !marker.exists() {
            fs::write(&marker, b"OK")?;
        }
        Ok(())
    }

    /// Removes the enable marker.
    pub fn disable(&self, ctx: &Context) -> Result<(), UnitError> {
        let _op = self.lock_op();
        let marker = ctx
            .paths
            .wants_dir()
            .join(format!("{}.service", self.name()));
        if marker.exists() {
            fs::remove_file(&marker)?;
        }
        Ok(())
    }

    /// Replaces the unit file in `/etc/systemd/system` with a `/dev/null`
    /// symlink and flags the unit masked.
    pub fn mask(&self, ctx: &Context) -> Result<(), UnitError> {
        let _op = self.lock_op();
        let target = ctx
            .paths
            .etc_unit_dir()
            .join(format!("{}.service", self.name()));
        if fs::symlink_metadata(&target).is_ok() {
            return Err(UnitError::MaskExists {
                path: target.display().to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        symlink("/dev/null", &target)?;
        self.write().masked = true;
        Ok(())
    }

    /// Removes the mask symlink if and only if that is what is there.
    pub fn unmask(&self, ctx: &Context) -> Result<(), UnitError> {
        let _op = self.lock_op();
        let target = ctx
            .paths
            .etc_unit_dir()
            .join(format!("{}.service", self.name()));
        let is_null_link = fs::symlink_metadata(&target)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false)
            && fs::read_link(&target)
                .map(|dest| dest == Path::new("/dev/null"))
                .unwrap_or(false);
        if is_null_link {
            fs::remove_file(&target)?;
        }
        self.write().masked = false;
        Ok(())
    }

    /// Hard-links every source path of this template to an instance-named
    /// sibling.
    pub fn create_instance(&self, parameter: &str) -> Result<(), UnitError> {
        let source_paths = self.read().source_paths.clone();
        if source_paths.is_empty() {
            return Err(UnitError::NoSourcePath);
        }
        for path in &source_paths {
            if !path.to_string_lossy().contains('@') {
                return Err(UnitError::NotInstance);
            }
        }
        for path in &source_paths {
            let dir = path.parent().unwrap_or(Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = file.strip_suffix(".service").unwrap_or(&file);
            let dest = dir.join(format!("{stem}{parameter}.service"));
            fs::hard_link(path, &dest)?;
        }
        Ok(())
    }

    /// Unlinks every source path.
    pub fn delete_service(&self) -> Result<(), UnitError> {
        for path in self.read().source_paths.clone() {
            let _ = fs::remove_file(&path);
        }
        Ok(())
    }
}

fn collect_stream<R>(stream: R) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut out = String::new();
        let mut stream = stream;
        let _ = stream.read_to_string(&mut out);
        out
    })
}

fn spawn_monitor(ctx: &Arc<Context>, unit: &Arc<Unit>, def: UnitDef) {
    let ctx = Arc::clone(ctx);
    let unit = Arc::clone(unit);
    thread::spawn(move || monitor(ctx, unit, def));
}

/// Waits out every process belonging to the unit, then applies the restart
/// policy.
fn monitor(ctx: Arc<Context>, unit: Arc<Unit>, def: UnitDef) {
    spawn_unneeded_watchdog(&ctx, &unit, &def);

    let handles: Vec<CommandHandle> = unit.read().commands.clone();
    let cmd_pids: Vec<libc::pid_t> = handles.iter().map(|handle| handle.pid()).collect();
    let mut statuses: Vec<ReapStatus> = handles.iter().map(|handle| handle.wait()).collect();
    unit.write().commands.clear();

    if def.service_type.is_background() {
        if let Some(pidfile) = &def.pid_file {
            if let Some(pid) = poll_pidfile(pidfile) {
                unit.write().aux_pids = vec![pid];
                if let Some(status) = ctx.reaper.wait_pid(pid) {
                    statuses.push(status);
                }
                unit.write().aux_pids.clear();
            }
        } else {
            // No pidfile: adopt any process re-parented to init that carries
            // our environment marker, until none remain.
            loop {
                let pids = find_marked_processes(unit.name());
                unit.write().aux_pids = pids.clone();
                for pid in &pids {
                    if let Some(status) = ctx.reaper.wait_pid(*pid) {
                        statuses.push(status);
                    }
                }
                if pids.is_empty() {
                    break;
                }
            }
        }
        // Drain descendants the fork tracker knows about.
        loop {
            let mut kids: Vec<libc::pid_t> = Vec::new();
            for pid in &cmd_pids {
                for child in ctx.tracker.find(*pid) {
                    if process_alive(child) && !kids.contains(&child) {
                        kids.push(child);
                    }
                }
            }
            unit.write().aux_pids = kids.clone();
            let mut found = false;
            for child in &kids {
                if let Some(status) = ctx.reaper.wait_pid(*child) {
                    found = true;
                    statuses.push(status);
                }
            }
            if !found {
                break;
            }
        }
        unit.write().aux_pids.clear();
    }

    let failed = statuses.iter().any(|status| !status.success());
    let action = if failed {
        def.failure_action.as_str()
    } else {
        def.success_action.as_str()
    };
    if action.starts_with("poweroff") {
        let mut cmd = Command::new("poweroff");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match ctx.reaper.launch(cmd) {
            Ok((handle, _child)) => {
                handle.wait();
            }
            Err(err) => warn!("failed to run poweroff: {err}"),
        }
        return;
    }

    let mut policy = def.restart;
    let state_now = unit.state();
    if matches!(
        state_now,
        UnitState::Stopped | UnitState::Stopping | UnitState::Restarting
    ) {
        policy = RestartPolicy::No;
    } else if upheld_by_running(&ctx, &def) {
        policy = RestartPolicy::Always;
    }
    let sleep = def
        .restart_sleep
        .filter(|s| !s.is_zero())
        .unwrap_or(DEFAULT_RESTART_SLEEP);
    let remain = def.effective_remain_after_exit();
    let exit_error = statuses
        .iter()
        .filter(|status| !status.success())
        .next_back()
        .map(|status| format!("process exited with error code {}", status.code));

    match policy {
        RestartPolicy::Always => {
            unit.write().state = UnitState::Restarting;
            thread::sleep(sleep);
            unit.write().state_error = None;
            for status in &statuses {
                if !status.success() {
                    warn!(
                        "<{}> Process exited with error code {}",
                        unit.name(),
                        status.code
                    );
                }
            }
            restart_after_sleep(&ctx, &unit, false);
        }
        RestartPolicy::OnFailure
        | RestartPolicy::OnAbnormal
        | RestartPolicy::OnWatchdog
        | RestartPolicy::OnAbort => {
            unit.write().state_error = exit_error.clone();
            if exit_error.is_some() {
                info!("Will restart {} in {:?}", unit.name(), sleep);
                unit.write().state = UnitState::Restarting;
                thread::sleep(sleep);
                info!("Restarting {}", unit.name());
                restart_after_sleep(&ctx, &unit, false);
            } else if !remain {
                finish_stopped(&ctx, &unit, &def);
            }
        }
        RestartPolicy::OnSuccess => {
            unit.write().state_error = exit_error.clone();
            if exit_error.is_none() && !remain {
                unit.write().state = UnitState::Restarting;
                thread::sleep(sleep);
                restart_after_sleep(&ctx, &unit, true);
            } else if exit_error.is_some() {
                finish_stopped(&ctx, &unit, &def);
            }
        }
        RestartPolicy::No => {
            unit.write().state_error = exit_error.clone();
            if !remain || exit_error.is_some() {
                finish_stopped(&ctx, &unit, &def);
            }
        }
    }
}

/// Re-starts the unit after a restart sleep, unless a stop request flipped
/// the state to Stopped mid-wait.
fn restart_after_sleep(ctx: &Arc<Context>, unit: &Arc<Unit>, propagate_on_failure: bool) {
    if unit.state() == UnitState::Stopped {
        return;
    }
    let manual = unit.read().manual;
    let result = {
        let _op = unit.lock_op();
        unit.start_locked(ctx, manual)
    };
    if let Err(err) = result {
        warn!("RESTART failed: {err}");
        if propagate_on_failure {
            let def = unit.definition().unwrap_or_default();
            propagate_stop(ctx, unit, &def);
        }
    }
}

fn finish_stopped(ctx: &Arc<Context>, unit: &Arc<Unit>, def: &UnitDef) {
    {
        let mut inner = unit.write();
        inner.state = UnitState::Stopped;
        inner.manual = false;
    }
    propagate_stop(ctx, unit, def);
}

/// Stops every BoundBy and ConsistsOf neighbour.
fn propagate_stop(ctx: &Arc<Context>, unit: &Arc<Unit>, def: &UnitDef) {
    let targets = def
        .relations
        .get(RelationKind::BoundBy)
        .iter()
        .chain(def.relations.get(RelationKind::ConsistsOf));
    for name in targets {
        let Some(dep) = ctx.graph.get(name) else { continue };
        if Arc::ptr_eq(&dep, unit) {
            continue;
        }
        if let Err(err) = dep.stop(ctx) {
            warn!("Failed to stop dependency {name}: {err}");
        }
    }
}

fn upheld_by_running(ctx: &Arc<Context>, def: &UnitDef) -> bool {
    def.relations
        .get(RelationKind::UpheldBy)
        .iter()
        .any(|name| {
            ctx.graph
                .get(name)
                .map(|unit| unit.state() == UnitState::Running)
                .unwrap_or(false)
        })
}

/// While the unit is Running and StopWhenUnneeded is set, stops it once none
/// of its reverse relations has a Running member.
fn spawn_unneeded_watchdog(ctx: &Arc<Context>, unit: &Arc<Unit>, def: &UnitDef) {
    if !def.stop_when_unneeded {
        return;
    }
    let reverse: Vec<String> = [
        RelationKind::WantedBy,
        RelationKind::RequiredBy,
        RelationKind::RequisiteOf,
        RelationKind::BoundBy,
        RelationKind::ConsistsOf,
        RelationKind::UpheldBy,
    ]
    .iter()
    .flat_map(|kind| def.relations.get(*kind).iter().cloned())
    .collect();
    let ctx = Arc::clone(ctx);
    let unit = Arc::clone(unit);
    thread::spawn(move || {
        loop {
            thread::sleep(UNNEEDED_POLL_INTERVAL);
            if unit.state() == UnitState::Stopped {
                break;
            }
            let needed = reverse.iter().any(|name| {
                ctx.graph
                    .get(name)
                    .map(|dep| dep.state() == UnitState::Running)
                    .unwrap_or(false)
            });
            if needed {
                continue;
            }
            if let Err(err) = unit.stop(&ctx) {
                warn!("Failed to stop service as unneeded: {}: {err}", unit.name());
            }
            break;
        }
    });
}

/// Reads a PID out of the pidfile, polling briefly for it to appear.
fn poll_pidfile(pidfile: &Path) -> Option<libc::pid_t> {
    let deadline = Instant::now() + PIDFILE_WAIT;
    loop {
        if let Ok(contents) = fs::read_to_string(pidfile) {
            let digits: String = contents.chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(pid) = digits.parse::<libc::pid_t>()
                && pid > 1
            {
                return Some(pid);
            }
            return None;
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(PIDFILE_POLL_INTERVAL);
    }
}

/// Processes re-parented to PID 1 whose environment carries this unit's
/// marker.
fn find_marked_processes(unit_name: &str) -> Vec<libc::pid_t> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_environ(UpdateKind::Always),
    );
    let marker = format!("{ENV_MARKER}={unit_name}");
    let mut pids: Vec<libc::pid_t> = Vec::new();
    for (pid, process) in system.processes() {
        if process.parent().map(|p| p.as_u32()) != Some(1) {
            continue;
        }
        if process
            .environ()
            .iter()
            .any(|entry| entry.to_string_lossy() == marker)
        {
            pids.push(pid.as_u32() as libc::pid_t);
        }
    }
    pids.sort_unstable();
    pids
}
