use crate::config::Paths;
use crate::descriptor::ProcessDescriptor;
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// On-disk persistence for descriptors and live PIDs.
///
/// Files are written create-temp-then-rename so a reader (including a
/// recovering supervisor) never observes a torn file.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: Paths,
}

impl StateStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn descriptor_path(&self, name: &str) -> PathBuf {
        self.paths.descriptors_dir().join(format!("{name}.yaml"))
    }

    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.paths.pids_dir().join(format!("{name}.pid"))
    }

    // ---------------- descriptors ----------------

    pub fn save_descriptor(&self, desc: &ProcessDescriptor) -> Result<()> {
        let raw = serde_yaml::to_string(desc).map_err(|e| {
            Error::os(
                format!("render descriptor {}", desc.name),
                std::io::Error::other(e),
            )
        })?;
        write_atomic(&self.descriptor_path(&desc.name), raw.as_bytes())
    }

    pub fn load_descriptor(&self, name: &str) -> Result<ProcessDescriptor> {
        let path = self.descriptor_path(name);
        let raw = fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("descriptor for {name}")))?;
        let desc: ProcessDescriptor = serde_yaml::from_str(&raw).map_err(|e| {
            Error::InvalidArgument(format!("malformed descriptor {}: {e}", path.display()))
        })?;
        Ok(desc)
    }

    pub fn remove_descriptor(&self, name: &str) -> Result<()> {
        let path = self.descriptor_path(name);
        fs::remove_file(&path).map_err(|e| Error::os(format!("remove {}", path.display()), e))
    }

    pub fn list_descriptors(&self) -> Result<Vec<ProcessDescriptor>> {
        let dir = self.paths.descriptors_dir();
        let mut out = vec![];
        let entries =
            fs::read_dir(&dir).map_err(|e| Error::os(format!("read {}", dir.display()), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("yaml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_descriptor(name) {
                Ok(d) => out.push(d),
                Err(e) => tracing::warn!("skipping descriptor {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    // ---------------- pid files ----------------

    pub fn write_pid(&self, name: &str, pid: i32) -> Result<()> {
        write_atomic(&self.pid_path(name), pid.to_string().as_bytes())
    }

    pub fn read_pid(&self, name: &str) -> Result<i32> {
        let path = self.pid_path(name);
        let raw =
            fs::read_to_string(&path).map_err(|_| Error::NotFound(format!("pid file for {name}")))?;
        raw.trim()
            .parse::<i32>()
            .map_err(|_| Error::InvalidArgument(format!("malformed pid file {}", path.display())))
    }

    pub fn remove_pid(&self, name: &str) -> Result<()> {
        let path = self.pid_path(name);
        fs::remove_file(&path).map_err(|e| Error::os(format!("remove {}", path.display()), e))
    }

    /// Names that have a `pids/<name>.pid` entry, for boot recovery.
    pub fn pid_file_names(&self) -> Result<Vec<String>> {
        let dir = self.paths.pids_dir();
        let mut out = vec![];
        let entries =
            fs::read_dir(&dir).map_err(|e| Error::os(format!("read {}", dir.display()), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("pid") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Write via a sibling temp file and rename into place.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidArgument(format!("no parent dir for {}", path.display())))?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("file")
    ));
    let mut f = fs::File::create(&tmp).map_err(|e| Error::os(format!("create {}", tmp.display()), e))?;
    f.write_all(data)
        .map_err(|e| Error::os(format!("write {}", tmp.display()), e))?;
    f.flush()
        .map_err(|e| Error::os(format!("flush {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::os(format!("rename {} -> {}", tmp.display(), path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_store() -> (StateStore, PathBuf) {
        let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("gem-store-test-{}-{n}", std::process::id()));
        let paths = Paths::new(&dir);
        paths.ensure_layout().unwrap();
        (StateStore::new(paths), dir)
    }

    #[test]
    fn descriptor_round_trip() {
        let (store, dir) = test_store();
        let mut d = ProcessDescriptor::new("svc", "/bin/sleep");
        d.args = vec!["5".into()];
        store.save_descriptor(&d).unwrap();
        let loaded = store.load_descriptor("svc").unwrap();
        assert_eq!(loaded.name, "svc");
        assert_eq!(loaded.args, vec!["5".to_string()]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn pid_round_trip_and_enumeration() {
        let (store, dir) = test_store();
        store.write_pid("a", 123).unwrap();
        store.write_pid("b", 456).unwrap();
        assert_eq!(store.read_pid("a").unwrap(), 123);
        assert_eq!(store.pid_file_names().unwrap(), vec!["a", "b"]);
        store.remove_pid("a").unwrap();
        assert_eq!(store.pid_file_names().unwrap(), vec!["b"]);
        assert!(matches!(store.read_pid("a"), Err(Error::NotFound(_))));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (store, dir) = test_store();
        store.write_pid("svc", 1).unwrap();
        let leftovers: Vec<_> = fs::read_dir(store.paths.pids_dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_descriptor_is_not_found() {
        let (store, dir) = test_store();
        assert!(matches!(
            store.load_descriptor("ghost"),
            Err(Error::NotFound(_))
        ));
        let _ = fs::remove_dir_all(dir);
    }
}
