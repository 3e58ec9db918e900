use crate::config::Paths;
use crate::descriptor::{self, ProcessDescriptor, RestartPolicy};
use crate::error::{Error, Result};
use crate::logs;
use crate::registry::{ManagedProcess, ProcessSnapshot, Registry, Status};
use crate::shell::ShellSession;
use crate::store::StateStore;
use crate::sys;
use chrono::Local;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Floor on the exit-to-respawn delay. A `restart_delay` of zero combined
/// with a child that exits immediately must not turn the monitor into a
/// spawn busy-loop.
pub const MIN_RESTART_DELAY: Duration = Duration::from_millis(200);

/// Liveness poll cadence for re-attached (recovered) processes, which have
/// no waitable child handle.
const RECOVERED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The process lifecycle engine: owns the registry and the state store,
/// spawns one monitor task per live record, and applies the restart policy
/// when a monitored child exits.
pub struct Engine {
    paths: Paths,
    store: StateStore,
    registry: Registry,
}

impl Engine {
    pub fn new(paths: Paths) -> Arc<Engine> {
        let store = StateStore::new(paths.clone());
        Arc::new(Engine {
            paths,
            store,
            registry: Registry::new(),
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ---------------- lookup ----------------

    pub async fn get(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("process {name}")))
    }

    pub async fn list(&self) -> Vec<Arc<ManagedProcess>> {
        self.registry.list().await
    }

    // ---------------- start ----------------

    pub async fn start(self: &Arc<Self>, desc: ProcessDescriptor) -> Result<ProcessSnapshot> {
        desc.validate()?;
        if desc.is_cluster() {
            return self.start_cluster(desc).await;
        }
        self.start_single(desc).await
    }

    async fn start_single(self: &Arc<Self>, desc: ProcessDescriptor) -> Result<ProcessSnapshot> {
        let record = ManagedProcess::new(desc.clone(), vec![]);
        // Reserve the name atomically; a live holder refuses the start,
        // a terminal leftover is replaced.
        self.registry
            .try_insert(Arc::clone(&record))
            .await
            .map_err(|live| {
                Error::AlreadyExists(format!(
                    "process {} ({})",
                    desc.name,
                    live.status()
                ))
            })?;

        match self.bring_up(&record).await {
            Ok(child) => {
                if !desc.hooks.post_start.is_empty() {
                    let d = desc.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            sys::run_hook("post_start", &d.hooks.post_start, &d.working_dir, &d.env)
                                .await
                        {
                            warn!("process {}: {e}", d.name);
                        }
                    });
                }
                let engine = Arc::clone(self);
                let rec = Arc::clone(&record);
                tokio::spawn(async move {
                    engine.monitor(rec, child).await;
                });
                info!("started process {} (pid {})", desc.name, record.pid());
                Ok(record.snapshot())
            }
            Err(e) => {
                // The start never reached running: leave the registry as the
                // caller found it.
                self.registry.remove(&desc.name).await;
                Err(e)
            }
        }
    }

    /// Pre-start hook, log files, spawn, persistence. The PID file and the
    /// descriptor are flushed before the record becomes observably running.
    async fn bring_up(&self, record: &Arc<ManagedProcess>) -> Result<Child> {
        let desc = &record.desc;
        if !desc.hooks.pre_start.is_empty() {
            sys::run_hook("pre_start", &desc.hooks.pre_start, &desc.working_dir, &desc.env)
                .await?;
        }
        let child = self.spawn_child(desc)?;
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        self.store.write_pid(&desc.name, pid)?;
        self.store.save_descriptor(desc)?;
        {
            let mut st = record.lock();
            st.pid = pid;
            st.started_at = Local::now();
            if st.status == Status::Stopping {
                // A stop() raced the start; honor it rather than resurrecting.
                let _ = sys::send_stop_signal(pid, false);
            } else {
                st.status = Status::Running;
            }
        }
        Ok(child)
    }

    fn spawn_child(&self, desc: &ProcessDescriptor) -> Result<Child> {
        let ids = if desc.user.is_empty() {
            None
        } else {
            Some(sys::resolve_user_group(&desc.user, &desc.group)?)
        };
        let stdout = sys::open_append_log(&desc.stdout_log(&self.paths))?;
        let stderr = sys::open_append_log(&desc.stderr_log(&self.paths))?;

        let mut cmd = Command::new(&desc.command);
        cmd.args(&desc.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if !desc.working_dir.is_empty() {
            cmd.current_dir(&desc.working_dir);
        }
        for (k, v) in &desc.env {
            cmd.env(k, v);
        }
        if let Some((uid, gid)) = ids {
            cmd.uid(uid);
            cmd.gid(gid);
        }
        cmd.spawn()
            .map_err(|e| Error::os(format!("spawn {}", desc.command), e))
    }

    async fn start_cluster(self: &Arc<Self>, desc: ProcessDescriptor) -> Result<ProcessSnapshot> {
        let children: Vec<String> = (0..desc.cluster.instances)
            .map(|i| descriptor::worker_name(&desc.name, i))
            .collect();
        let parent = ManagedProcess::new(desc.clone(), children);
        self.registry
            .try_insert(Arc::clone(&parent))
            .await
            .map_err(|live| {
                Error::AlreadyExists(format!("process {} ({})", desc.name, live.status()))
            })?;

        let mut started = 0u32;
        for i in 0..desc.cluster.instances {
            match self.start_single(desc.worker(i)).await {
                Ok(_) => started += 1,
                Err(e) => error!("cluster {}: worker {i} failed to start: {e}", desc.name),
            }
        }
        if started == 0 {
            self.registry.remove(&desc.name).await;
            return Err(Error::os(
                format!("cluster {}", desc.name),
                std::io::Error::other("no worker instance could be started"),
            ));
        }
        parent.lock().status = Status::Running;
        self.store.save_descriptor(&desc)?;
        info!("started cluster {} with {started} instances", desc.name);
        Ok(parent.snapshot())
    }

    // ---------------- stop ----------------

    /// Deliver the stop signal and return. Removal happens asynchronously
    /// when the monitor observes the exit; callers wanting a synchronous
    /// stop poll `get()` until it reports NotFound.
    pub async fn stop(self: &Arc<Self>, name: &str, force: bool) -> Result<()> {
        let record = self.get(name).await?;
        if record.is_cluster_master() {
            return Box::pin(self.stop_cluster(&record, force)).await;
        }

        {
            let st = record.lock();
            if st.status.is_terminal() {
                return Err(Error::PreconditionFailed(format!(
                    "process {name} is already {}",
                    st.status
                )));
            }
        }
        let desc = record.desc.clone();
        if !desc.hooks.pre_stop.is_empty() {
            if let Err(e) =
                sys::run_hook("pre_stop", &desc.hooks.pre_stop, &desc.working_dir, &desc.env).await
            {
                warn!("process {name}: {e}");
            }
        }
        let pid = {
            let mut st = record.lock();
            // The monitor may have finalized the record while the pre-stop
            // hook ran; a terminal record must not be wedged in `stopping`.
            if st.status.is_terminal() {
                return Err(Error::PreconditionFailed(format!(
                    "process {name} is already {}",
                    st.status
                )));
            }
            st.status = Status::Stopping;
            st.pid
        };
        if pid > 0 {
            sys::send_stop_signal(pid, force)?;
        }
        Ok(())
    }

    async fn stop_cluster(self: &Arc<Self>, record: &Arc<ManagedProcess>, force: bool) -> Result<()> {
        let desc = record.desc.clone();
        {
            let mut st = record.lock();
            if st.status == Status::Stopping {
                return Ok(());
            }
            st.status = Status::Stopping;
        }
        if !desc.hooks.pre_stop.is_empty() {
            if let Err(e) =
                sys::run_hook("pre_stop", &desc.hooks.pre_stop, &desc.working_dir, &desc.env).await
            {
                warn!("process {}: {e}", desc.name);
            }
        }

        // Fan out in index order. Terminal leftovers are reaped directly,
        // live workers go through the normal signal path.
        for child in &record.children {
            match self.registry.get(child).await {
                None => {}
                Some(w) if w.status().is_terminal() => {
                    self.registry.remove(child).await;
                }
                Some(_) => {
                    if let Err(e) = self.stop(child, force).await {
                        warn!("cluster {}: stop worker {child}: {e}", desc.name);
                    }
                }
            }
        }

        // The master leaves the registry only after the last worker did.
        let engine = Arc::clone(self);
        let rec = Arc::clone(record);
        tokio::spawn(async move {
            loop {
                let mut remaining = false;
                for child in &rec.children {
                    match engine.registry.get(child).await {
                        None => {}
                        Some(w) if w.status().is_terminal() => {
                            engine.registry.remove(child).await;
                        }
                        Some(_) => remaining = true,
                    }
                }
                if !remaining {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            engine.finalize_removed(&rec).await;
        });
        Ok(())
    }

    // ---------------- restart ----------------

    /// Stop, wait out `restart_delay`, start the same descriptor afresh.
    /// The restart counter of the new record starts at zero.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<()> {
        let record = self.get(name).await?;
        if record.is_cluster_master() {
            for child in record.children.clone() {
                if let Err(e) = Box::pin(self.restart(&child)).await {
                    warn!("cluster {name}: restart worker {child}: {e}");
                }
            }
            return Ok(());
        }

        let desc = record.desc.clone();
        if record.status().is_terminal() {
            self.registry.remove(name).await;
        } else {
            match self.stop(name, false).await {
                Ok(()) => self.wait_removed(name, Duration::from_secs(30)).await?,
                // Exited on its own in the meantime: just clear the leftover.
                Err(Error::PreconditionFailed(_)) => {
                    self.registry.remove(name).await;
                }
                Err(e) => return Err(e),
            }
        }
        tokio::time::sleep(Duration::from_secs(desc.restart_delay)).await;
        self.start(desc).await?;
        Ok(())
    }

    async fn wait_removed(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        while self.registry.contains(name).await {
            if std::time::Instant::now() >= deadline {
                return Err(Error::os(
                    format!("process {name}"),
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "did not stop within the wait budget",
                    ),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    // ---------------- logs ----------------

    pub async fn logs(&self, name: &str, stream: &str, lines: i64) -> Result<Vec<String>> {
        let record = self.get(name).await?;
        if record.is_cluster_master() {
            return Err(Error::PreconditionFailed(format!(
                "{name} is a cluster master; request logs from a worker instance"
            )));
        }
        let path = self.log_path(&record.desc, stream)?;
        logs::tail_lines(&path, lines)
    }

    pub fn log_path(&self, desc: &ProcessDescriptor, stream: &str) -> Result<PathBuf> {
        match stream {
            "stdout" => Ok(desc.stdout_log(&self.paths)),
            "stderr" => Ok(desc.stderr_log(&self.paths)),
            other => Err(Error::InvalidArgument(format!(
                "unknown stream {other:?} (expected stdout or stderr)"
            ))),
        }
    }

    // ---------------- shell attachment ----------------

    /// Spawn a sibling shell on a fresh PTY, inheriting the target's working
    /// directory and environment. Refused for cluster masters and for
    /// records that are not running.
    pub async fn attach_shell(&self, name: &str) -> Result<ShellSession> {
        let record = self.get(name).await?;
        if record.is_cluster_master() {
            return Err(Error::PreconditionFailed(format!(
                "{name} is a cluster master; attach to a worker instance"
            )));
        }
        {
            let st = record.lock();
            if st.status != Status::Running {
                return Err(Error::PreconditionFailed(format!(
                    "process {name} is not running ({})",
                    st.status
                )));
            }
        }
        let session = ShellSession::spawn(&record.desc.working_dir, &record.desc.env)?;
        record.lock().shell = Some(session.clone());
        Ok(session)
    }

    pub async fn detach_shell(&self, name: &str) -> Result<()> {
        let record = self.get(name).await?;
        if let Some(session) = record.lock().shell.take() {
            session.close();
        }
        Ok(())
    }

    // ---------------- recovery ----------------

    /// Boot-time re-attachment: scan `pids/`, rebuild records for PIDs the
    /// kernel still acknowledges, drop stale PID files. Returns how many
    /// records were reconstructed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let mut recovered = 0usize;
        for name in self.store.pid_file_names()? {
            let pid = match self.store.read_pid(&name) {
                Ok(p) => p,
                Err(e) => {
                    warn!("process {name}: {e}");
                    continue;
                }
            };
            let desc = match self.store.load_descriptor(&name) {
                Ok(d) => d,
                Err(_) => {
                    warn!("process {name} has a pid file but no descriptor; ignoring");
                    continue;
                }
            };
            if !sys::pid_alive(pid) {
                if let Err(e) = self.store.remove_pid(&name) {
                    warn!("process {name}: {e}");
                }
                continue;
            }
            if self.registry.contains(&name).await {
                continue;
            }

            let record = ManagedProcess::new(desc, vec![]);
            {
                let mut st = record.lock();
                st.pid = pid;
                st.status = Status::Running;
                // Kernel accounting beats "now": survivors keep their uptime.
                st.started_at = sys::process_start_time(pid).unwrap_or_else(Local::now);
            }
            self.registry.insert(Arc::clone(&record)).await;
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.watch_recovered(record, pid).await;
            });
            info!("re-attached process {name} (pid {pid})");
            recovered += 1;
        }

        self.rebuild_cluster_masters().await;
        Ok(recovered)
    }

    /// Re-synthesize master records for clusters whose workers survived.
    async fn rebuild_cluster_masters(self: &Arc<Self>) {
        let descs = match self.store.list_descriptors() {
            Ok(d) => d,
            Err(e) => {
                warn!("recovery: {e}");
                return;
            }
        };
        for desc in descs {
            if !desc.is_cluster() || self.registry.contains(&desc.name).await {
                continue;
            }
            let children: Vec<String> = (0..desc.cluster.instances)
                .map(|i| descriptor::worker_name(&desc.name, i))
                .collect();
            let mut any = false;
            for c in &children {
                if self.registry.contains(c).await {
                    any = true;
                    break;
                }
            }
            if !any {
                continue;
            }
            let parent = ManagedProcess::new(desc.clone(), children);
            parent.lock().status = Status::Running;
            self.registry.insert(parent).await;
            info!("re-attached cluster master {}", desc.name);
        }
    }

    /// A re-attached process has no waitable handle; poll the kernel. The
    /// exit status of a non-child is unobservable, so no restart policy is
    /// applied when it dies.
    async fn watch_recovered(self: Arc<Self>, record: Arc<ManagedProcess>, pid: i32) {
        loop {
            tokio::time::sleep(RECOVERED_POLL_INTERVAL).await;
            if !sys::pid_alive(pid) {
                if record.lock().status == Status::Stopping {
                    self.finalize_removed(&record).await;
                } else {
                    self.finalize_terminal(&record, Status::Stopped).await;
                }
                return;
            }
        }
    }

    /// Start every persisted descriptor marked `autostart: true` that is not
    /// already represented in the registry.
    pub async fn autostart(self: &Arc<Self>) -> Result<usize> {
        let mut started = 0usize;
        for desc in self.store.list_descriptors()? {
            if !desc.auto_start || descriptor::is_cluster_worker(&desc.name) {
                continue;
            }
            if self.registry.contains(&desc.name).await {
                continue;
            }
            match self.start(desc.clone()).await {
                Ok(_) => started += 1,
                Err(e) => warn!("autostart {}: {e}", desc.name),
            }
        }
        Ok(started)
    }

    // ---------------- monitor ----------------

    async fn monitor(self: Arc<Self>, record: Arc<ManagedProcess>, mut child: Child) {
        let name = record.desc.name.clone();
        'supervise: loop {
            let wait = child.wait().await;
            let (mut clean, mut code) = match &wait {
                Ok(status) => (status.success(), status.code()),
                Err(e) => {
                    warn!("process {name}: wait failed: {e}");
                    (false, None)
                }
            };

            // Policy loop: a failed respawn feeds back in as another failed
            // exit without anything to wait on.
            loop {
                let decision = {
                    let mut st = record.lock();
                    if st.status == Status::Stopping {
                        Decision::Remove
                    } else {
                        match evaluate_exit(
                            record.desc.restart_policy,
                            clean,
                            st.restart_count,
                            record.desc.max_restarts,
                        ) {
                            ExitOutcome::Stop(s) => Decision::Terminal(s),
                            ExitOutcome::Restart => {
                                st.status = Status::Restarting;
                                st.pid = 0;
                                Decision::Respawn {
                                    attempt: st.restart_count + 1,
                                }
                            }
                        }
                    }
                };

                match decision {
                    Decision::Remove => {
                        self.finalize_removed(&record).await;
                        return;
                    }
                    Decision::Terminal(status) => {
                        self.finalize_terminal(&record, status).await;
                        return;
                    }
                    Decision::Respawn { attempt } => {
                        let delay =
                            Duration::from_secs(record.desc.restart_delay).max(MIN_RESTART_DELAY);
                        tokio::time::sleep(delay).await;
                        if record.status() == Status::Stopping {
                            self.finalize_removed(&record).await;
                            return;
                        }
                        record.lock().restart_count = attempt;
                        self.append_restart_note(&record.desc, code, attempt);
                        match self.spawn_child(&record.desc) {
                            Ok(c) => {
                                let pid = c.id().map(|p| p as i32).unwrap_or(0);
                                if let Err(e) = self.store.write_pid(&name, pid) {
                                    warn!("process {name}: {e}");
                                }
                                {
                                    let mut st = record.lock();
                                    st.pid = pid;
                                    st.started_at = Local::now();
                                    st.status = Status::Running;
                                }
                                child = c;
                                continue 'supervise;
                            }
                            Err(e) => {
                                warn!("process {name}: respawn failed: {e}");
                                clean = false;
                                code = None;
                            }
                        }
                    }
                }
            }
        }
    }

    fn append_restart_note(&self, desc: &ProcessDescriptor, code: Option<i32>, attempt: u32) {
        let code_s = code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let max_s = if desc.max_restarts == 0 {
            "unlimited".to_string()
        } else {
            desc.max_restarts.to_string()
        };
        let line = format!(
            "[{}] process exited (code={code_s}), restarting ({attempt}/{max_s})\n",
            Local::now().to_rfc3339()
        );
        match sys::open_append_log(&desc.stdout_log(&self.paths)) {
            Ok(mut f) => {
                let _ = f.write_all(line.as_bytes());
            }
            Err(e) => warn!("process {}: {e}", desc.name),
        }
    }

    /// Policy said no restart: the record stays, terminal status visible,
    /// PID file gone.
    async fn finalize_terminal(&self, record: &Arc<ManagedProcess>, status: Status) {
        {
            let mut st = record.lock();
            st.status = status;
            st.pid = 0;
            if let Some(session) = st.shell.take() {
                session.close();
            }
        }
        if let Err(e) = self.store.remove_pid(&record.desc.name) {
            warn!("process {}: {e}", record.desc.name);
        }
        info!(
            "process {} is {status} and will not be restarted",
            record.desc.name
        );
    }

    /// Stop-initiated teardown: PID file, post-stop hook, registry entry.
    async fn finalize_removed(&self, record: &Arc<ManagedProcess>) {
        {
            let mut st = record.lock();
            st.status = Status::Stopped;
            st.pid = 0;
            if let Some(session) = st.shell.take() {
                session.close();
            }
        }
        let desc = record.desc.clone();
        if !record.is_cluster_master() {
            if let Err(e) = self.store.remove_pid(&desc.name) {
                warn!("process {}: {e}", desc.name);
            }
        }
        if !desc.hooks.post_stop.is_empty() {
            if let Err(e) =
                sys::run_hook("post_stop", &desc.hooks.post_stop, &desc.working_dir, &desc.env)
                    .await
            {
                warn!("process {}: {e}", desc.name);
            }
        }
        self.registry.remove(&desc.name).await;
        info!("process {} stopped", desc.name);
    }
}

// ---------------- restart policy ----------------

enum Decision {
    Remove,
    Terminal(Status),
    Respawn { attempt: u32 },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    Stop(Status),
    Restart,
}

/// Restart decision for an observed exit. `clean` means exit status 0 with
/// no signal; termination by signal counts as failure.
pub(crate) fn evaluate_exit(
    policy: RestartPolicy,
    clean: bool,
    restart_count: u32,
    max_restarts: u32,
) -> ExitOutcome {
    match policy {
        RestartPolicy::Never => ExitOutcome::Stop(if clean {
            Status::Stopped
        } else {
            Status::Failed
        }),
        RestartPolicy::OnFailure if clean => ExitOutcome::Stop(Status::Stopped),
        _ => {
            if max_restarts != 0 && restart_count >= max_restarts {
                ExitOutcome::Stop(Status::Failed)
            } else {
                ExitOutcome::Restart
            }
        }
    }
}
