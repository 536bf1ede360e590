//! Parses control-channel argument vectors and drives the supervisor.
//!
//! Progress is streamed to the connection as it happens; each line ends with
//! `OK` or `FAIL` (error text after the `FAIL`). Unknown subcommands and help
//! requests are soft errors: the help text goes back with exit code 0.

use std::{io::Write, sync::Arc};

use clap::{Parser, Subcommand, error::ErrorKind};
use tracing::info;

use crate::{
    error::UnitError,
    supervisor::Context,
    unit::{Unit, base_name},
};

#[derive(Parser)]
#[command(
    name = "systemctl",
    about = "Control the minisysd supervisor",
    disable_version_flag = true
)]
struct ControlCli {
    #[command(subcommand)]
    command: ControlCommand,
}

#[derive(Subcommand)]
enum ControlCommand {
    /// Shut the system down.
    Poweroff,
    /// Enable services so they start at boot.
    Enable {
        /// Also start the services now.
        #[arg(long)]
        now: bool,
        names: Vec<String>,
    },
    /// Disable services.
    Disable { names: Vec<String> },
    /// Reload all unit files.
    DaemonReload,
    /// Start services.
    Start { names: Vec<String> },
    /// Stop services.
    Stop { names: Vec<String> },
    /// Restart services.
    Restart { names: Vec<String> },
    /// Reload services (ExecReload, or SIGHUP when unset).
    Reload { names: Vec<String> },
    /// Show the state of services.
    Status { names: Vec<String> },
    /// Mask services so they cannot be started.
    Mask { names: Vec<String> },
    /// Unmask services.
    Unmask { names: Vec<String> },
    /// Show the full definition of services.
    Show { names: Vec<String> },
    /// Create a new instance from a template service.
    CreateInstance { names: Vec<String> },
    /// Delete an instance service.
    DeleteInstance { names: Vec<String> },
    /// List known services.
    List,
}

/// What the connection handler needs to finish the response.
pub struct DispatchOutcome {
    /// Exit code for the trailer.
    pub code: u16,
    /// Send SIGTERM to the supervisor after responding.
    pub poweroff: bool,
}

impl DispatchOutcome {
    fn done(code: u16) -> Self {
        Self {
            code,
            poweroff: false,
        }
    }
}

/// Executes one received argument vector, streaming output into `out`.
pub fn dispatch(ctx: &Arc<Context>, args: &[String], out: &mut dyn Write) -> DispatchOutcome {
    info!("COMMAND: Received command {args:?}");
    let parsed = ControlCli::try_parse_from(
        std::iter::once("systemctl".to_string()).chain(args.iter().cloned()),
    );
    let cli = match parsed {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp
                | ErrorKind::DisplayVersion
                | ErrorKind::InvalidSubcommand
                | ErrorKind::MissingSubcommand => 0,
                _ => 1,
            };
            let _ = write!(out, "{}", err.render());
            return DispatchOutcome::done(code);
        }
    };

    match cli.command {
        ControlCommand::Poweroff => {
            let _ = writeln!(out, "Shutting down system...");
            DispatchOutcome {
                code: 0,
                poweroff: true,
            }
        }
        ControlCommand::Enable { now, names } => {
            if let Err(message) = ensure_instances(ctx, &names) {
                return fail(out, &message);
            }
            let units = match resolve_units(ctx, &names) {
                Ok(units) => units,
                Err(message) => return fail(out, &message),
            };
            let code = for_each_unit(ctx, out, &units, "Enable", |ctx, unit| {
                unit.enable(ctx)?;
                if now {
                    unit.start(ctx)?;
                }
                Ok(())
            });
            DispatchOutcome::done(code)
        }
        ControlCommand::Disable { names } => {
            run_simple(ctx, out, &names, "Disable", |ctx, unit| unit.disable(ctx))
        }
        ControlCommand::DaemonReload => {
            ctx.graph.reload(&ctx.paths);
            let _ = writeln!(out, "Reload: unit files OK");
            DispatchOutcome::done(0)
        }
        ControlCommand::Start { names } => {
            if let Err(message) = ensure_instances(ctx, &names) {
                return fail(out, &message);
            }
            run_simple(ctx, out, &names, "Start", |ctx, unit| unit.start(ctx))
        }
        ControlCommand::Stop { names } => {
            run_simple(ctx, out, &names, "Stop", |ctx, unit| unit.stop(ctx))
        }
        ControlCommand::Restart { names } => {
            run_simple(ctx, out, &names, "Restart", |ctx, unit| unit.restart(ctx))
        }
        ControlCommand::Reload { names } => {
            run_simple(ctx, out, &names, "Reload", |ctx, unit| unit.reload(ctx))
        }
        ControlCommand::Status { names } => {
            let names = if names.is_empty() {
                ctx.graph.list()
            } else {
                names
            };
            let units = match resolve_units(ctx, &names) {
                Ok(units) => units,
                Err(message) => return fail(out, &message),
            };
            for unit in &units {
                let _ = writeln!(out, "{}", unit.status_line());
            }
            DispatchOutcome::done(0)
        }
        ControlCommand::Mask { names } => {
            run_simple(ctx, out, &names, "Mask", |ctx, unit| unit.mask(ctx))
        }
        ControlCommand::Unmask { names } => {
            run_simple(ctx, out, &names, "Unmask", |ctx, unit| unit.unmask(ctx))
        }
        ControlCommand::Show { names } => {
            let units = match resolve_units(ctx, &names) {
                Ok(units) => units,
                Err(message) => return fail(out, &message),
            };
            for unit in &units {
                let _ = writeln!(out, "=== {} ===", unit.name());
                let _ = write!(out, "{}", unit.detail());
            }
            DispatchOutcome::done(0)
        }
        ControlCommand::CreateInstance { names } => {
            if names.is_empty() {
                return fail(out, usage_message());
            }
            for name in &names {
                match create_one_instance(ctx, name) {
                    Ok(()) => {
                        let _ = writeln!(out, "Create: {name} OK");
                    }
                    Err(message) => {
                        let _ = writeln!(out, "Create: {name} FAIL: {message}");
                        return DispatchOutcome::done(1);
                    }
                }
            }
            ctx.graph.reload(&ctx.paths);
            DispatchOutcome::done(0)
        }
        ControlCommand::DeleteInstance { names } => {
            let units = match resolve_units(ctx, &names) {
                Ok(units) => units,
                Err(message) => return fail(out, &message),
            };
            let code = for_each_unit(ctx, out, &units, "Delete", |_, unit| unit.delete_service());
            ctx.graph.reload(&ctx.paths);
            DispatchOutcome::done(code)
        }
        ControlCommand::List => {
            for name in ctx.graph.list() {
                let enabled = ctx
                    .graph
                    .get(&name)
                    .map(|unit| unit.is_enabled(ctx))
                    .unwrap_or(false);
                if enabled {
                    let _ = writeln!(out, "{name} (enabled)");
                } else {
                    let _ = writeln!(out, "{name}");
                }
            }
            DispatchOutcome::done(0)
        }
    }
}

fn usage_message() -> &'static str {
    "service name not provided; usage: systemctl command servicename"
}

fn fail(out: &mut dyn Write, message: &str) -> DispatchOutcome {
    let _ = writeln!(out, "FAIL: {message}");
    DispatchOutcome::done(1)
}

fn resolve_units(ctx: &Arc<Context>, names: &[String]) -> Result<Vec<Arc<Unit>>, String> {
    if names.is_empty() {
        return Err(usage_message().to_string());
    }
    let mut units = Vec::with_capacity(names.len());
    for name in names {
        match ctx.graph.find(&ctx.paths, name) {
            Ok(unit) => units.push(unit),
            Err(err) => return Err(format!("{}: {err}", base_name(name))),
        }
    }
    Ok(units)
}

/// For `start` and `enable` on `@`-instance names: create any missing
/// instance from its template, then reload once.
fn ensure_instances(ctx: &Arc<Context>, names: &[String]) -> Result<(), String> {
    let mut need_reload = false;
    for name in names {
        let base = base_name(name);
        let Some((template, parameter)) = base.split_once('@') else {
            continue;
        };
        if parameter.is_empty() || ctx.graph.get(base).is_some() {
            continue;
        }
        need_reload = true;
        let template_name = format!("{template}@");
        let template_unit = ctx
            .graph
            .find(&ctx.paths, &template_name)
            .map_err(|err| format!("{template_name}: {err}"))?;
        template_unit
            .create_instance(parameter)
            .map_err(|err| format!("{}: {err}", template_unit.name()))?;
    }
    if need_reload {
        ctx.graph.reload(&ctx.paths);
    }
    Ok(())
}

fn create_one_instance(ctx: &Arc<Context>, name: &str) -> Result<(), String> {
    let base = base_name(name);
    let Some((template, parameter)) = base.split_once('@') else {
        return Err("instance names take the form template@parameter".to_string());
    };
    let template_name = format!("{template}@");
    let template_unit = ctx
        .graph
        .find(&ctx.paths, &template_name)
        .map_err(|err| format!("{template_name}: {err}"))?;
    template_unit
        .create_instance(parameter)
        .map_err(|err| err.to_string())
}

fn run_simple(
    ctx: &Arc<Context>,
    out: &mut dyn Write,
    names: &[String],
    verb: &str,
    op: impl Fn(&Arc<Context>, &Arc<Unit>) -> Result<(), UnitError>,
) -> DispatchOutcome {
    let units = match resolve_units(ctx, names) {
        Ok(units) => units,
        Err(message) => return fail(out, &message),
    };
    DispatchOutcome::done(for_each_unit(ctx, out, &units, verb, op))
}

/// Runs one operation per unit, streaming a progress line for each; stops at
/// the first failure.
fn for_each_unit(
    ctx: &Arc<Context>,
    out: &mut dyn Write,
    units: &[Arc<Unit>],
    verb: &str,
    op: impl Fn(&Arc<Context>, &Arc<Unit>) -> Result<(), UnitError>,
) -> u16 {
    for unit in units {
        let _ = write!(out, "{verb}: {}", unit.name());
        let _ = out.flush();
        match op(ctx, unit) {
            Ok(()) => {
                let _ = writeln!(out, " OK");
            }
            Err(err) => {
                let _ = writeln!(out, " FAIL: {err}");
                return 1;
            }
        }
    }
    0
}
