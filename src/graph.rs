//! The loaded-unit graph and its reload walk.

use std::{
    collections::HashMap,
    fs,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use tracing::warn;

use crate::{
    error::UnitError,
    paths::Paths,
    unit::{RelationKind, Unit, UnitState, base_name, parse_unit_file},
};

/// All known units, keyed by name with the `.service` suffix stripped.
#[derive(Default)]
pub struct UnitGraph {
    units: RwLock<HashMap<String, Arc<Unit>>>,
}

impl UnitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a unit up without touching the disk. Accepts both `foo` and
    /// `foo.service`.
    pub fn get(&self, name: &str) -> Option<Arc<Unit>> {
        self.units
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .get(base_name(name))
            .cloned()
    }

    /// Looks a unit up, reloading once if it is not yet known.
    pub fn find(&self, paths: &Paths, name: &str) -> Result<Arc<Unit>, UnitError> {
        if let Some(unit) = self.get(name) {
            return Ok(unit);
        }
        self.reload(paths);
        self.get(name).ok_or(UnitError::NotFound)
    }

    /// Unit names in lexicographic order.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .units
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Re-reads every unit file and drop-in from the search directories.
    ///
    /// Current definitions are shadowed while parsing so a failed parse can
    /// restore them; inverse relations are re-synced from scratch afterwards;
    /// units whose files disappeared are evicted once they are Stopped.
    pub fn reload(&self, paths: &Paths) {
        let mut units = self.units.write().unwrap_or_else(|err| err.into_inner());

        for unit in units.values() {
            let mut inner = unit.write();
            inner.old_def = inner.def.take();
        }

        let mut failed: Vec<String> = Vec::new();
        let mut processed: Vec<PathBuf> = Vec::new();
        let search_dirs = paths.search_dirs();

        // Primary unit files.
        for dir in &search_dirs {
            for fpath in sorted_entries(dir) {
                if fpath.is_dir() {
                    continue;
                }
                let Some(file_name) = fpath.file_name().map(|f| f.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let Some(name) = file_name.strip_suffix(".service") else {
                    continue;
                };
                let unit = units
                    .entry(name.to_string())
                    .or_insert_with(|| Unit::new(name))
                    .clone();
                {
                    let mut inner = unit.write();
                    if !inner.source_paths.contains(&fpath) {
                        inner.source_paths.push(fpath.clone());
                    }
                    inner.masked = false;
                }

                let mut processed_file = fpath.clone();
                let mut is_masked = false;
                if is_symlink(&fpath)
                    && let Ok(dest) = fs::read_link(&fpath)
                {
                    if dest == Path::new("/dev/null") {
                        unit.write().masked = true;
                        is_masked = true;
                    } else {
                        processed_file = dest;
                    }
                }

                if !is_masked && !processed.contains(&processed_file) {
                    processed.push(processed_file);
                    parse_into(&unit, &fpath, &mut failed);
                }
            }
        }

        // Drop-in directories.
        for dir in &search_dirs {
            for dpath in sorted_entries(dir) {
                if !dpath.is_dir() {
                    continue;
                }
                let Some(dir_name) = dpath.file_name().map(|f| f.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let Some(name) = dir_name.strip_suffix(".service.d") else {
                    continue;
                };
                if failed.iter().any(|f| f == name) {
                    continue;
                }
                let Some(unit) = units.get(name).cloned() else {
                    continue;
                };
                for conf in sorted_entries(&dpath) {
                    if conf.is_dir() || conf.extension().map(|e| e != "conf").unwrap_or(true) {
                        continue;
                    }
                    {
                        let mut inner = unit.write();
                        if !inner.source_paths.contains(&conf) {
                            inner.source_paths.push(conf.clone());
                        }
                    }
                    let processed_file = if is_symlink(&conf) {
                        fs::read_link(&conf).unwrap_or_else(|_| conf.clone())
                    } else {
                        conf.clone()
                    };
                    if !processed.contains(&processed_file) {
                        processed.push(processed_file);
                        parse_into(&unit, &conf, &mut failed);
                    }
                }
            }
        }

        // Drop shadows; evict units that lost their definition and are idle.
        // Masked units never parse, so the mask flag keeps them resident.
        units.retain(|_, unit| {
            let mut inner = unit.write();
            inner.old_def = None;
            inner.def.is_some() || inner.masked || inner.state != UnitState::Stopped
        });

        // Re-sync inverse relations by name.
        let names: Vec<String> = units.keys().cloned().collect();
        for name in &names {
            let unit = units[name].clone();
            let forward: Vec<(RelationKind, Vec<String>)> = {
                let inner = unit.read();
                let Some(def) = &inner.def else { continue };
                RelationKind::ALL
                    .iter()
                    .filter_map(|kind| {
                        kind.inverse().map(|inverse| {
                            (inverse, def.relations.get(*kind).iter().cloned().collect())
                        })
                    })
                    .collect()
            };
            for (inverse, targets) in forward {
                for target in targets {
                    let Some(other) = units.get(base_name(&target)) else {
                        // Unknown target: the forward edge stays recorded
                        // without an inverse link.
                        continue;
                    };
                    if Arc::ptr_eq(other, &unit) {
                        let mut inner = unit.write();
                        if let Some(def) = &mut inner.def {
                            def.relations.get_mut(inverse).insert(name.clone());
                        }
                        continue;
                    }
                    let mut inner = other.write();
                    if let Some(def) = &mut inner.def {
                        def.relations.get_mut(inverse).insert(name.clone());
                    }
                }
            }
        }
    }
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
    paths.sort();
    paths
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

fn parse_into(unit: &Arc<Unit>, fpath: &Path, failed: &mut Vec<String>) {
    let file = match fs::File::open(fpath) {
        Ok(file) => file,
        Err(err) => {
            warn!("Could not read {}: {err}", fpath.display());
            return;
        }
    };
    let mut def = {
        let mut inner = unit.write();
        inner.def.take().unwrap_or_default()
    };
    let result = parse_unit_file(unit.name(), &mut def, BufReader::new(file));
    let mut inner = unit.write();
    match result {
        Ok(()) => inner.def = Some(def),
        Err(err) => {
            inner.def = inner.old_def.take();
            failed.push(unit.name().to_string());
            warn!("ERROR loading unit file {}: {err}", fpath.display());
        }
    }
}
