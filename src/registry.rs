use crate::descriptor::ProcessDescriptor;
use crate::shell::ShellSession;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;

// ---------------- Process status ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Starting,
    Running,
    Stopping,
    Restarting,
    Stopped,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Restarting => "restarting",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
        }
    }

    /// Terminal statuses may be replaced by a fresh `start()`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Stopped | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------- Live record ----------------

/// Mutable runtime state of a record, guarded by the record's own lock.
#[derive(Debug)]
pub struct RunState {
    pub status: Status,
    /// OS pid; 0 until spawned and after terminal transitions.
    pub pid: i32,
    pub started_at: DateTime<Local>,
    /// Monotonic across the life of this record; reset only by `restart()`.
    pub restart_count: u32,
    pub shell: Option<ShellSession>,
}

/// Live in-memory representation of one supervised process (or one cluster
/// master). Created on start, destroyed on terminal removal.
///
/// Only the lifecycle engine mutates `RunState`; everyone else reads
/// snapshots.
#[derive(Debug)]
pub struct ManagedProcess {
    pub desc: ProcessDescriptor,
    /// Worker names, in index order; non-empty only for cluster masters.
    pub children: Vec<String>,
    state: Mutex<RunState>,
}

impl ManagedProcess {
    pub fn new(desc: ProcessDescriptor, children: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            desc,
            children,
            state: Mutex::new(RunState {
                status: Status::Starting,
                pid: 0,
                started_at: Local::now(),
                restart_count: 0,
                shell: None,
            }),
        })
    }

    pub fn is_cluster_master(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn pid(&self) -> i32 {
        self.lock().pid
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let st = self.lock();
        ProcessSnapshot {
            name: self.desc.name.clone(),
            status: st.status,
            pid: st.pid,
            started_at: st.started_at.to_rfc3339(),
            uptime_secs: (Local::now() - st.started_at).num_seconds().max(0),
            restarts: st.restart_count,
            command: self.desc.command.clone(),
            args: self.desc.args.clone(),
            instances: self.children.len() as u32,
            children: self.children.clone(),
        }
    }
}

/// Read-only view of a record, safe to serialize across the API boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub name: String,
    pub status: Status,
    pub pid: i32,
    pub started_at: String,
    pub uptime_secs: i64,
    pub restarts: u32,
    pub command: String,
    pub args: Vec<String>,
    /// Worker count for cluster masters, 0 otherwise.
    pub instances: u32,
    pub children: Vec<String>,
}

// ---------------- Registry ----------------

/// Name -> record map with a read/write discipline: lookups and snapshots
/// take the read lock, membership changes take the write lock. Record
/// mutation goes through the record's own lock, never this one.
#[derive(Debug, Default)]
pub struct Registry {
    map: RwLock<HashMap<String, Arc<ManagedProcess>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.map.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.map.read().await.contains_key(name)
    }

    /// Snapshot of all records, sorted by name. Stability after return is
    /// not guaranteed; callers treat it as a point-in-time view.
    pub async fn list(&self) -> Vec<Arc<ManagedProcess>> {
        let map = self.map.read().await;
        let mut v: Vec<_> = map.values().cloned().collect();
        v.sort_by(|a, b| a.desc.name.cmp(&b.desc.name));
        v
    }

    pub async fn insert(&self, record: Arc<ManagedProcess>) {
        self.map
            .write()
            .await
            .insert(record.desc.name.clone(), record);
    }

    /// Insert `record` only if the name is absent or its current holder is
    /// terminal. Returns the previous terminal record when one was replaced,
    /// or an Err with the live holder.
    pub async fn try_insert(
        &self,
        record: Arc<ManagedProcess>,
    ) -> std::result::Result<Option<Arc<ManagedProcess>>, Arc<ManagedProcess>> {
        let mut map = self.map.write().await;
        if let Some(existing) = map.get(&record.desc.name) {
            if !existing.status().is_terminal() {
                return Err(Arc::clone(existing));
            }
        }
        Ok(map.insert(record.desc.name.clone(), record))
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.map.write().await.remove(name)
    }
}
