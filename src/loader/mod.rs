//! Service description loading.
//!
//! Maps service names to description files in a search path and inserts the
//! resulting records into the service set, loading dependencies first. This
//! is the only component that resolves service names from disk; once loaded,
//! the core works purely on the in-memory graph.

mod parser;

pub use parser::parse_service;

use std::path::{Path, PathBuf};

use crate::services::{AddServiceError, ServiceId, ServiceSet};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("service description for '{0}' not found")]
    NotFound(String),
    #[error("service '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("service '{name}' line {line}: {reason}")]
    Parse {
        name: String,
        line: usize,
        reason: String,
    },
    #[error("service '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error("circular dependency involving service '{0}'")]
    DependencyCycle(String),
    #[error(transparent)]
    Add(#[from] AddServiceError),
}

/// Search path for service description files.
#[derive(Debug, Clone)]
pub struct ServiceDirs {
    dirs: Vec<PathBuf>,
}

impl ServiceDirs {
    /// System-wide service descriptions.
    pub fn system() -> Self {
        ServiceDirs {
            dirs: vec![PathBuf::from("/etc/dinit.d")],
        }
    }

    /// Per-user service descriptions.
    pub fn user() -> Self {
        let mut dirs = Vec::new();
        if let Some(home) = std::env::var_os("HOME") {
            dirs.push(Path::new(&home).join(".config/dinit.d"));
        }
        dirs.push(PathBuf::from("/etc/dinit.d"));
        ServiceDirs { dirs }
    }

    /// A single explicit directory (overrides the defaults).
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        ServiceDirs {
            dirs: vec![dir.into()],
        }
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|d| d.join(name))
            .find(|p| p.is_file())
    }
}

/// Load the named service (and, recursively, its dependencies) into the
/// set. Already-loaded services are returned as-is.
pub fn load_service(
    set: &mut ServiceSet,
    dirs: &ServiceDirs,
    name: &str,
) -> Result<ServiceId, LoadError> {
    let mut loading = Vec::new();
    load_service_inner(set, dirs, name, &mut loading)
}

fn load_service_inner(
    set: &mut ServiceSet,
    dirs: &ServiceDirs,
    name: &str,
    loading: &mut Vec<String>,
) -> Result<ServiceId, LoadError> {
    if let Some(id) = set.find_service(name) {
        return Ok(id);
    }
    if loading.iter().any(|n| n == name) {
        return Err(LoadError::DependencyCycle(name.to_string()));
    }

    let path = dirs
        .find(name)
        .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
    let content = std::fs::read_to_string(&path).map_err(|e| LoadError::Io {
        name: name.to_string(),
        source: e,
    })?;
    let config = parser::parse_service(name, &content)?;

    loading.push(name.to_string());
    for dep in config.depends_on.iter().chain(config.waits_for.iter()) {
        load_service_inner(set, dirs, dep, loading)?;
    }
    loading.pop();

    let id = set.add_service(config)?;
    log::debug!("loaded service {}", name);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LoopHandle;
    use std::fs;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dinit-loader-{}-{}", std::process::id(), tag));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_with_dependencies() {
        let dir = test_dir("deps");
        fs::write(dir.join("a"), "type = internal\ndepends-on = b\n").unwrap();
        fs::write(dir.join("b"), "type = internal\nwaits-for = c\n").unwrap();
        fs::write(dir.join("c"), "type = internal\n").unwrap();

        let (handle, _rx) = LoopHandle::new();
        let mut set = ServiceSet::new(handle);
        let dirs = ServiceDirs::from_dir(&dir);
        let a = load_service(&mut set, &dirs, "a").unwrap();

        assert_eq!(set.loaded_count(), 3);
        let rec = set.service(a).unwrap();
        assert_eq!(rec.depends_on.len(), 1);
        let b = set.find_service("b").unwrap();
        assert_eq!(rec.depends_on[0], b);
        let b_rec = set.service(b).unwrap();
        assert_eq!(b_rec.soft_deps.len(), 1);
    }

    #[test]
    fn missing_service_reports_not_found() {
        let dir = test_dir("missing");
        let (handle, _rx) = LoopHandle::new();
        let mut set = ServiceSet::new(handle);
        let dirs = ServiceDirs::from_dir(&dir);
        match load_service(&mut set, &dirs, "ghost") {
            Err(LoadError::NotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn dependency_cycle_is_detected() {
        let dir = test_dir("cycle");
        fs::write(dir.join("x"), "type = internal\ndepends-on = y\n").unwrap();
        fs::write(dir.join("y"), "type = internal\ndepends-on = x\n").unwrap();

        let (handle, _rx) = LoopHandle::new();
        let mut set = ServiceSet::new(handle);
        let dirs = ServiceDirs::from_dir(&dir);
        match load_service(&mut set, &dirs, "x") {
            Err(LoadError::DependencyCycle(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
