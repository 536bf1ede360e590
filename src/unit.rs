//! Unit records and the unit-file parser.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::BufRead,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use serde::{Serialize, Serializer};
use strum_macros::{Display, EnumString};

use crate::{
    duration::{format_duration, parse_duration},
    error::ParseError,
    reaper::CommandHandle,
};

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum UnitState {
    /// At least one launched command is alive (or RemainAfterExit holds).
    Running,
    /// Nothing running; the initial state.
    #[default]
    Stopped,
    /// A start operation is in flight.
    Starting,
    /// A stop operation is in flight.
    Stopping,
    /// The monitor is waiting out the restart sleep.
    Restarting,
}

/// Service type from `Type=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// Foreground process, considered up once spawned.
    #[default]
    Simple,
    /// Alias of simple.
    Exec,
    /// Parent forks and exits; the real daemon is found via pidfile or marker.
    Forking,
    /// Runs to completion; considered up afterwards unless configured not to.
    Oneshot,
    /// Backgrounding type, tracked like forking.
    Dbus,
    /// Backgrounding type, tracked like forking.
    Notify,
    /// Backgrounding type, tracked like forking.
    NotifyReload,
    /// Treated as simple.
    Idle,
}

impl ServiceType {
    /// Types whose real processes must be discovered after the launched
    /// command exits.
    pub fn is_background(self) -> bool {
        matches!(
            self,
            ServiceType::Forking | ServiceType::Dbus | ServiceType::Notify | ServiceType::NotifyReload
        )
    }
}

/// Restart policy from `Restart=`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Restart regardless of the exit outcome.
    Always,
    /// Restart only after a clean exit.
    OnSuccess,
    /// Restart only after a failed exit.
    OnFailure,
    /// Treated like on-failure.
    OnAbnormal,
    /// Treated like on-failure.
    OnWatchdog,
    /// Treated like on-failure.
    OnAbort,
}

/// One direction of a unit relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Wants,
    WantedBy,
    Requires,
    RequiredBy,
    Requisite,
    RequisiteOf,
    BindsTo,
    BoundBy,
    PartOf,
    ConsistsOf,
    Upholds,
    UpheldBy,
    Conflicts,
    ConflictedBy,
    Before,
    After,
    OnFailure,
    OnSuccess,
}

impl RelationKind {
    /// Every relation direction, for iteration during graph sync.
    pub const ALL: [RelationKind; 18] = [
        RelationKind::Wants,
        RelationKind::WantedBy,
        RelationKind::Requires,
        RelationKind::RequiredBy,
        RelationKind::Requisite,
        RelationKind::RequisiteOf,
        RelationKind::BindsTo,
        RelationKind::BoundBy,
        RelationKind::PartOf,
        RelationKind::ConsistsOf,
        RelationKind::Upholds,
        RelationKind::UpheldBy,
        RelationKind::Conflicts,
        RelationKind::ConflictedBy,
        RelationKind::Before,
        RelationKind::After,
        RelationKind::OnFailure,
        RelationKind::OnSuccess,
    ];

    /// The opposite direction. OnFailure/OnSuccess are launch lists, not
    /// bidirectional relations, and have none.
    pub fn inverse(self) -> Option<RelationKind> {
        Some(match self {
            RelationKind::Wants => RelationKind::WantedBy,
            RelationKind::WantedBy => RelationKind::Wants,
            RelationKind::Requires => RelationKind::RequiredBy,
            RelationKind::RequiredBy => RelationKind::Requires,
            RelationKind::Requisite => RelationKind::RequisiteOf,
            RelationKind::RequisiteOf => RelationKind::Requisite,
            RelationKind::BindsTo => RelationKind::BoundBy,
            RelationKind::BoundBy => RelationKind::BindsTo,
            RelationKind::PartOf => RelationKind::ConsistsOf,
            RelationKind::ConsistsOf => RelationKind::PartOf,
            RelationKind::Upholds => RelationKind::UpheldBy,
            RelationKind::UpheldBy => RelationKind::Upholds,
            RelationKind::Conflicts => RelationKind::ConflictedBy,
            RelationKind::ConflictedBy => RelationKind::Conflicts,
            RelationKind::Before => RelationKind::After,
            RelationKind::After => RelationKind::Before,
            RelationKind::OnFailure | RelationKind::OnSuccess => return None,
        })
    }
}

/// The relation sets of one unit, keyed by the names as written in its files.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Relations {
    wants: BTreeSet<String>,
    wanted_by: BTreeSet<String>,
    requires: BTreeSet<String>,
    required_by: BTreeSet<String>,
    requisite: BTreeSet<String>,
    requisite_of: BTreeSet<String>,
    binds_to: BTreeSet<String>,
    bound_by: BTreeSet<String>,
    part_of: BTreeSet<String>,
    consists_of: BTreeSet<String>,
    upholds: BTreeSet<String>,
    upheld_by: BTreeSet<String>,
    conflicts: BTreeSet<String>,
    conflicted_by: BTreeSet<String>,
    before: BTreeSet<String>,
    after: BTreeSet<String>,
    on_failure: BTreeSet<String>,
    on_success: BTreeSet<String>,
}

impl Relations {
    /// The set for one direction.
    pub fn get(&self, kind: RelationKind) -> &BTreeSet<String> {
        match kind {
            RelationKind::Wants => &self.wants,
            RelationKind::WantedBy => &self.wanted_by,
            RelationKind::Requires => &self.requires,
            RelationKind::RequiredBy => &self.required_by,
            RelationKind::Requisite => &self.requisite,
            RelationKind::RequisiteOf => &self.requisite_of,
            RelationKind::BindsTo => &self.binds_to,
            RelationKind::BoundBy => &self.bound_by,
            RelationKind::PartOf => &self.part_of,
            RelationKind::ConsistsOf => &self.consists_of,
            RelationKind::Upholds => &self.upholds,
            RelationKind::UpheldBy => &self.upheld_by,
            RelationKind::Conflicts => &self.conflicts,
            RelationKind::ConflictedBy => &self.conflicted_by,
            RelationKind::Before => &self.before,
            RelationKind::After => &self.after,
            RelationKind::OnFailure => &self.on_failure,
            RelationKind::OnSuccess => &self.on_success,
        }
    }

    /// Mutable access for one direction.
    pub fn get_mut(&mut self, kind: RelationKind) -> &mut BTreeSet<String> {
        match kind {
            RelationKind::Wants => &mut self.wants,
            RelationKind::WantedBy => &mut self.wanted_by,
            RelationKind::Requires => &mut self.requires,
            RelationKind::RequiredBy => &mut self.required_by,
            RelationKind::Requisite => &mut self.requisite,
            RelationKind::RequisiteOf => &mut self.requisite_of,
            RelationKind::BindsTo => &mut self.binds_to,
            RelationKind::BoundBy => &mut self.bound_by,
            RelationKind::PartOf => &mut self.part_of,
            RelationKind::ConsistsOf => &mut self.consists_of,
            RelationKind::Upholds => &mut self.upholds,
            RelationKind::UpheldBy => &mut self.upheld_by,
            RelationKind::Conflicts => &mut self.conflicts,
            RelationKind::ConflictedBy => &mut self.conflicted_by,
            RelationKind::Before => &mut self.before,
            RelationKind::After => &mut self.after,
            RelationKind::OnFailure => &mut self.on_failure,
            RelationKind::OnSuccess => &mut self.on_success,
        }
    }

    fn assign(&mut self, kind: RelationKind, value: &str) {
        let set = self.get_mut(kind);
        if value.is_empty() {
            set.clear();
        } else {
            set.extend(value.split_whitespace().map(|v| v.to_string()));
        }
    }
}

fn serialize_opt_duration<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(duration) => serializer.serialize_some(&format_duration(*duration)),
        None => serializer.serialize_none(),
    }
}

/// Everything a unit's files declare about it.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnitDef {
    pub description: String,
    #[serde(flatten)]
    pub relations: Relations,
    pub stop_when_unneeded: bool,
    pub failure_action: String,
    pub success_action: String,
    #[serde(rename = "Type")]
    pub service_type: ServiceType,
    /// Explicit `RemainAfterExit=`; when unset, oneshot units imply `true`.
    pub remain_after_exit: Option<bool>,
    pub pid_file: Option<PathBuf>,
    pub exec_start: Vec<String>,
    pub exec_stop: Vec<String>,
    pub exec_start_pre: Vec<String>,
    pub exec_start_post: Vec<String>,
    pub exec_stop_pre: Vec<String>,
    pub exec_stop_post: Vec<String>,
    pub exec_condition: Vec<String>,
    pub exec_reload: Option<String>,
    #[serde(serialize_with = "serialize_opt_duration")]
    pub restart_sleep: Option<Duration>,
    #[serde(serialize_with = "serialize_opt_duration")]
    pub stop_timeout: Option<Duration>,
    pub restart: RestartPolicy,
    pub working_directory: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub environment: Vec<String>,
    pub environment_files: Vec<String>,
    /// `Limit*` keys, parsed but only warned about.
    pub limits: BTreeMap<String, String>,
}

impl UnitDef {
    /// Whether the unit counts as up after its processes exit cleanly.
    pub fn effective_remain_after_exit(&self) -> bool {
        self.remain_after_exit
            .unwrap_or(self.service_type == ServiceType::Oneshot)
    }
}

/// Runtime state of a unit, guarded by the unit's state lock.
#[derive(Default)]
pub struct UnitInner {
    pub state: UnitState,
    pub state_error: Option<String>,
    pub def: Option<UnitDef>,
    /// Shadow copy held while a reload is in flight.
    pub old_def: Option<UnitDef>,
    /// Primary file plus drop-ins, in load order.
    pub source_paths: Vec<PathBuf>,
    pub masked: bool,
    /// Started directly rather than as a dependency.
    pub manual: bool,
    /// One handle per launched `ExecStart` line while Running.
    pub commands: Vec<CommandHandle>,
    /// Ancillary PIDs the monitor is currently waiting on.
    pub aux_pids: Vec<libc::pid_t>,
}

/// One loaded unit. Lifecycle operations serialise on `op`; `inner` is taken
/// briefly for reads and mutations so status rendering never blocks behind a
/// subprocess wait.
pub struct Unit {
    name: String,
    op: Mutex<()>,
    inner: RwLock<UnitInner>,
}

/// Strips a trailing `.service`, the form unit names take as map keys.
pub fn base_name(name: &str) -> &str {
    name.strip_suffix(".service").unwrap_or(name)
}

impl Unit {
    /// Creates a stopped, empty unit record.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            op: Mutex::new(()),
            inner: RwLock::new(UnitInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The instance parameter for `foo@bar` style names.
    pub fn instance_parameter(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, param)| param)
    }

    pub(crate) fn lock_op(&self) -> MutexGuard<'_, ()> {
        self.op.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, UnitInner> {
        self.inner.read().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, UnitInner> {
        self.inner.write().unwrap_or_else(|err| err.into_inner())
    }

    pub fn state(&self) -> UnitState {
        self.read().state
    }

    pub fn state_error(&self) -> Option<String> {
        self.read().state_error.clone()
    }

    pub fn is_masked(&self) -> bool {
        self.read().masked
    }

    /// A copy of the current definition, if the unit still has one.
    pub fn definition(&self) -> Option<UnitDef> {
        self.read().def.clone()
    }

    /// One status row: `State: <state> [(masked)] [(pids)]: <name>[ ERROR: <text>]`.
    pub fn status_line(&self) -> String {
        let inner = self.read();
        let mut msg = format!("State: {}", inner.state);
        if inner.masked {
            msg.push_str(" (masked)");
        }
        if inner.state == UnitState::Running {
            let mut pids: Vec<String> =
                inner.commands.iter().map(|c| c.pid().to_string()).collect();
            pids.extend(inner.aux_pids.iter().map(|p| p.to_string()));
            if !pids.is_empty() {
                msg.push_str(&format!(" ({})", pids.join(", ")));
            }
        }
        msg.push_str(&format!(": {}", self.name));
        if let Some(err) = &inner.state_error {
            msg.push_str(&format!(" ERROR: {err}"));
        }
        msg
    }

    /// The full definition as YAML, for `show`.
    pub fn detail(&self) -> String {
        let inner = self.read();
        let body = inner
            .def
            .as_ref()
            .and_then(|def| serde_yaml::to_string(def).ok())
            .unwrap_or_default();
        format!("{body}Masked: {}\n", inner.masked)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Unit,
    Service,
    Install,
    Skip,
}

const LIMIT_KEYS: [&str; 16] = [
    "LIMITCPU",
    "LIMITFSIZE",
    "LIMITDATA",
    "LIMITSTACK",
    "LIMITCORE",
    "LIMITRSS",
    "LIMITNOFILE",
    "LIMITAS",
    "LIMITNPROC",
    "LIMITMEMLOCK",
    "LIMITLOCKS",
    "LIMITSIGPENDING",
    "LIMITMSGQUEUE",
    "LIMITNICE",
    "LIMITRTPRIO",
    "LIMITRTTIME",
];

/// Parses one unit file or drop-in into `def`, layering onto whatever is
/// already there: list keys append, relation keys append or clear, scalars
/// overwrite.
pub fn parse_unit_file<R: BufRead>(
    unit_name: &str,
    def: &mut UnitDef,
    reader: R,
) -> Result<(), ParseError> {
    let instance = unit_name
        .split_once('@')
        .map(|(_, param)| base_name(param).to_string());
    let mut section = Section::None;
    let mut pending = String::new();

    for raw in reader.lines() {
        let raw = raw?;
        let trimmed = raw.trim();
        if trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.ends_with('\\') {
            let chunk = raw.trim_end();
            pending.push_str(chunk.strip_suffix('\\').unwrap_or(chunk));
            pending.push(' ');
            continue;
        }
        let line = if pending.is_empty() {
            raw
        } else {
            let mut joined = std::mem::take(&mut pending);
            joined.push_str(raw.trim_end());
            joined
        };
        let trimmed = line.trim();

        match trimmed.to_uppercase().as_str() {
            "[UNIT]" => {
                section = Section::Unit;
                continue;
            }
            "[SERVICE]" => {
                section = Section::Service;
                continue;
            }
            "[INSTALL]" => {
                section = Section::Install;
                continue;
            }
            other => {
                if other.starts_with('[') && other.ends_with(']') {
                    section = Section::Skip;
                    continue;
                }
            }
        }

        let (key, value) = parse_key_value(&line);
        match section {
            Section::Unit => apply_unit_key(def, &key, &value),
            Section::Install => apply_install_key(def, &key, &value),
            Section::Service => apply_service_key(def, &key, value, instance.as_deref())?,
            Section::None | Section::Skip => {}
        }
    }
    Ok(())
}

/// Splits `key=value`, upper-casing the key, trimming the value, and
/// stripping a wholly-wrapping pair of single or double quotes.
fn parse_key_value(line: &str) -> (String, String) {
    let Some((left, right)) = line.split_once('=') else {
        return (line.trim().to_uppercase(), String::new());
    };
    let key = left.trim().to_uppercase();
    let trimmed = right.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        return (key, trimmed.trim_matches('"').to_string());
    }
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        return (key, trimmed.trim_matches('\'').to_string());
    }
    (key, trimmed.to_string())
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn apply_unit_key(def: &mut UnitDef, key: &str, value: &str) {
    let relation = match key {
        "WANTS" => Some(RelationKind::Wants),
        "WANTEDBY" => Some(RelationKind::WantedBy),
        "REQUIRES" => Some(RelationKind::Requires),
        "REQUIREDBY" => Some(RelationKind::RequiredBy),
        "REQUISITE" => Some(RelationKind::Requisite),
        "REQUISITEOF" => Some(RelationKind::RequisiteOf),
        "BINDSTO" => Some(RelationKind::BindsTo),
        "BOUNDBY" => Some(RelationKind::BoundBy),
        "PARTOF" => Some(RelationKind::PartOf),
        "CONSISTSOF" => Some(RelationKind::ConsistsOf),
        "UPHOLDS" => Some(RelationKind::Upholds),
        "UPHELDBY" => Some(RelationKind::UpheldBy),
        "CONFLICTS" => Some(RelationKind::Conflicts),
        "CONFLICTEDBY" => Some(RelationKind::ConflictedBy),
        "BEFORE" => Some(RelationKind::Before),
        "AFTER" => Some(RelationKind::After),
        "ONFAILURE" => Some(RelationKind::OnFailure),
        "ONSUCCESS" => Some(RelationKind::OnSuccess),
        _ => None,
    };
    if let Some(kind) = relation {
        def.relations.assign(kind, value);
        return;
    }
    match key {
        "DESCRIPTION" => def.description = value.to_string(),
        "STOPWHENUNNEEDED" => def.stop_when_unneeded = parse_bool(value),
        "FAILUREACTION" => def.failure_action = value.to_string(),
        "SUCCESSACTION" => def.success_action = value.to_string(),
        _ => {}
    }
}

fn apply_install_key(def: &mut UnitDef, key: &str, value: &str) {
    let relation = match key {
        "REQUIREDBY" => Some(RelationKind::RequiredBy),
        "WANTEDBY" => Some(RelationKind::WantedBy),
        "UPHELDBY" => Some(RelationKind::UpheldBy),
        _ => None,
    };
    if let Some(kind) = relation {
        def.relations.assign(kind, value);
    }
}

fn apply_service_key(
    def: &mut UnitDef,
    key: &str,
    value: String,
    instance: Option<&str>,
) -> Result<(), ParseError> {
    let expand = |value: String| -> String {
        match instance {
            Some(param) => value.replace("%i", param).replace("%I", param),
            None => value,
        }
    };
    match key {
        "TYPE" => {
            def.service_type = value
                .parse()
                .map_err(|_| ParseError::UnknownServiceType(value))?;
        }
        "REMAINAFTEREXIT" => def.remain_after_exit = Some(parse_bool(&value)),
        "PIDFILE" => def.pid_file = Some(PathBuf::from(value)),
        "EXECSTART" => def.exec_start.push(expand(value)),
        "EXECSTOP" => def.exec_stop.push(expand(value)),
        "EXECSTARTPRE" => def.exec_start_pre.push(expand(value)),
        "EXECSTARTPOST" => def.exec_start_post.push(expand(value)),
        "EXECSTOPPRE" => def.exec_stop_pre.push(expand(value)),
        "EXECSTOPPOST" => def.exec_stop_post.push(expand(value)),
        "EXECCONDITION" => def.exec_condition.push(expand(value)),
        "EXECRELOAD" => def.exec_reload = Some(expand(value)),
        "RESTARTSEC" => def.restart_sleep = Some(parse_duration(&value)?),
        "TIMEOUTSEC" | "TIMEOUTSTOPSEC" => def.stop_timeout = Some(parse_duration(&value)?),
        "RESTART" => {
            def.restart = value
                .parse()
                .map_err(|_| ParseError::UnknownRestartPolicy(value))?;
        }
        "WORKINGDIRECTORY" => def.working_directory = Some(PathBuf::from(value)),
        "USER" => def.user = Some(value),
        "GROUP" => def.group = Some(value),
        "ENVIRONMENT" => def.environment.push(value),
        "ENVIRONMENTFILE" => def.environment_files.push(value),
        key if LIMIT_KEYS.contains(&key) => {
            def.limits.insert(key.to_string(), value);
        }
        _ => {}
    }
    Ok(())
}
