//! Fork tracking reported by the preload library.
//!
//! Every process in the container loads a small shared object via
//! `/etc/ld.so.preload` that reports `parent:child[:grandchild]` PID tuples
//! to a dedicated socket whenever it forks. The tracker keeps the relation
//! map so the supervisor can find descendants that were re-parented to PID 1
//! and still need reaping.

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    io::{self, Read},
    os::unix::{fs::PermissionsExt, net::UnixListener},
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use tracing::{error, warn};

use crate::paths::Paths;

// Placeholder blobs; release builds ship the real per-arch libraries.
#[cfg(target_arch = "x86_64")]
static FORK_LIBRARY: &[u8] = include_bytes!("../assets/fork_amd64.so");
#[cfg(target_arch = "aarch64")]
static FORK_LIBRARY: &[u8] = include_bytes!("../assets/fork_arm64.so");
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
static FORK_LIBRARY: &[u8] = &[];

#[cfg(target_arch = "x86_64")]
static NOOP_LIBRARY: &[u8] = include_bytes!("../assets/nofork_amd64.so");
#[cfg(target_arch = "aarch64")]
static NOOP_LIBRARY: &[u8] = include_bytes!("../assets/nofork_arm64.so");
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
static NOOP_LIBRARY: &[u8] = &[];

/// Parent-to-children PID relations reported over the tracker socket.
pub struct ForkTracker {
    relations: Mutex<HashMap<libc::pid_t, Vec<libc::pid_t>>>,
}

impl ForkTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            relations: Mutex::new(HashMap::new()),
        })
    }

    /// Records one reported fork event.
    pub fn add(&self, parent: libc::pid_t, child: libc::pid_t, grandchild: Option<libc::pid_t>) {
        let mut relations = self.relations.lock().unwrap_or_else(|err| err.into_inner());
        relations.entry(parent).or_default().push(child);
        if let Some(grandchild) = grandchild {
            relations.entry(child).or_default().push(grandchild);
        }
    }

    /// Transitive descendants of `pid` that have been orphaned to PID 1 and
    /// are therefore still the supervisor's responsibility to reap.
    pub fn find(&self, pid: libc::pid_t) -> Vec<libc::pid_t> {
        let relations = self.relations.lock().unwrap_or_else(|err| err.into_inner());
        let mut seen = BTreeSet::new();
        collect(&relations, pid, &mut seen);
        let init_children: &[libc::pid_t] = relations
            .get(&1)
            .map(|children| children.as_slice())
            .unwrap_or(&[]);
        seen.into_iter()
            .filter(|child| init_children.contains(child))
            .collect()
    }

    /// Binds the tracker socket and serves reports on a background thread.
    pub fn listen(self: &Arc<Self>, socket_path: &Path) -> io::Result<()> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        let tracker = Arc::clone(self);
        thread::spawn(move || {
            loop {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let mut buf = [0u8; 256];
                        let n = match stream.read(&mut buf) {
                            Ok(n) => n,
                            Err(err) => {
                                warn!("PID-TRACK: read failed: {err}");
                                continue;
                            }
                        };
                        let message = String::from_utf8_lossy(&buf[..n]);
                        if !tracker.ingest(message.trim()) {
                            warn!("PID-TRACK: message malformed: {message:?}");
                        }
                    }
                    Err(err) => {
                        error!("PID-TRACK: accept failed: {err}");
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        });
        Ok(())
    }

    /// Parses one `parent:child[:grandchild]` report. Returns false when the
    /// message does not decode.
    fn ingest(&self, message: &str) -> bool {
        let fields: Vec<&str> = message.split(':').collect();
        if fields.len() != 2 && fields.len() != 3 {
            return false;
        }
        let mut pids = Vec::with_capacity(3);
        for field in &fields {
            match field.parse::<libc::pid_t>() {
                Ok(pid) => pids.push(pid),
                Err(_) => return false,
            }
        }
        self.add(pids[0], pids[1], pids.get(2).copied());
        true
    }
}

fn collect(
    relations: &HashMap<libc::pid_t, Vec<libc::pid_t>>,
    pid: libc::pid_t,
    seen: &mut BTreeSet<libc::pid_t>,
) {
    if let Some(children) = relations.get(&pid) {
        for &child in children {
            if seen.insert(child) {
                collect(relations, child, seen);
            }
        }
    }
}

/// Writes the preload library (or its no-op shim) and, when tracking is
/// enabled, adds it to `/etc/ld.so.preload`.
pub fn install_preload(paths: &Paths, enabled: bool) -> io::Result<()> {
    let library = paths.preload_library();
    if let Some(parent) = library.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&library, if enabled { FORK_LIBRARY } else { NOOP_LIBRARY })?;
    fs::set_permissions(&library, fs::Permissions::from_mode(0o755))?;
    if !enabled {
        return Ok(());
    }

    let preload_path = paths.ld_so_preload();
    let library_line = library.display().to_string();
    let existing = fs::read_to_string(&preload_path).unwrap_or_default();
    if !existing.contains(&library_line) {
        let updated = if existing.is_empty() {
            format!("{library_line}\n")
        } else {
            format!("{existing}\n{library_line}\n")
        };
        fs::write(&preload_path, updated)?;
    }
    Ok(())
}
