//! Helpers for resolving filesystem locations relative to the supervisor root.
//!
//! Everything the supervisor touches on disk goes through a [`Paths`] value so
//! that a sandboxed root (tests, chroot-like setups) can stand in for `/`. The
//! default root comes from the `MINISYSD_ROOT` environment variable, falling
//! back to `/`.

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{OnceLock, RwLock},
};

/// Timestamp format used at the front of every service log line.
pub const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Resolved filesystem layout for one supervisor instance.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

static CONTEXT: OnceLock<RwLock<Paths>> = OnceLock::new();

fn context_lock() -> &'static RwLock<Paths> {
    CONTEXT.get_or_init(|| RwLock::new(Paths::from_env()))
}

/// Returns a snapshot of the active path context.
pub fn current() -> Paths {
    context_lock()
        .read()
        .unwrap_or_else(|err| err.into_inner())
        .clone()
}

/// Re-roots the global path context. Later [`current`] calls see the new root.
pub fn init_root(root: &Path) {
    let mut guard = context_lock().write().unwrap_or_else(|err| err.into_inner());
    *guard = Paths::with_root(root.to_path_buf());
}

/// Strips the `.service` suffix and any leading dots from a unit name,
/// yielding the stem used for log files.
pub fn safe_unit_name(unit: &str) -> &str {
    unit.strip_suffix(".service")
        .unwrap_or(unit)
        .trim_start_matches('.')
}

impl Paths {
    fn from_env() -> Self {
        let root = env::var_os("MINISYSD_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::with_root(root)
    }

    /// Builds a context anchored at an explicit root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// The root every other path hangs off.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn join(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// The administrator unit directory, also where mask symlinks land.
    pub fn etc_unit_dir(&self) -> PathBuf {
        self.join("etc/systemd/system")
    }

    /// Marker directory that records which units are enabled.
    pub fn wants_dir(&self) -> PathBuf {
        self.join("etc/systemd/system/multi-user.target.wants")
    }

    /// Unit search directories, in priority order.
    ///
    /// Distributions symlink `/lib/systemd` and `/usr/lib/systemd` into each
    /// other in various combinations; collapsing the symlinked side keeps each
    /// canonical file from being processed twice.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let etc = self.etc_unit_dir();
        let usr_lib = self.join("usr/lib/systemd/system");
        let lib = self.join("lib/systemd/system");
        let probes: [(&str, &PathBuf); 6] = [
            ("lib/systemd/system", &usr_lib),
            ("usr/lib/systemd/system", &lib),
            ("lib/systemd", &usr_lib),
            ("usr/lib/systemd", &lib),
            ("lib", &usr_lib),
            ("usr/lib", &lib),
        ];
        for (probe, keep) in probes {
            if is_symlink(&self.join(probe)) {
                return vec![etc, keep.clone()];
            }
        }
        vec![etc, usr_lib, lib]
    }

    /// Directory holding per-service log files.
    pub fn log_dir(&self) -> PathBuf {
        self.join("var/log/services")
    }

    /// Log file for one unit.
    pub fn unit_log_file(&self, unit: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", safe_unit_name(unit)))
    }

    /// The control socket systemctl clients connect to.
    pub fn control_socket(&self) -> PathBuf {
        self.join("tmp/minisysd.sock")
    }

    /// The socket the preload library reports fork events to.
    pub fn tracker_socket(&self) -> PathBuf {
        self.join("tmp/minisysd-pidtrack.sock")
    }

    /// File recording the supervisor boot time as RFC 3339.
    pub fn boot_file(&self) -> PathBuf {
        self.join("etc/boot-time")
    }

    /// Where the fork-reporting preload library is written.
    pub fn preload_library(&self) -> PathBuf {
        self.join("usr/local/lib/fork.so")
    }

    /// The dynamic loader preload list.
    pub fn ld_so_preload(&self) -> PathBuf {
        self.join("etc/ld.so.preload")
    }
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
