use crate::config::Paths;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::sys;
use chrono::{Local, Timelike};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// A named automation script, persisted as `scripts/<name>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    /// Path of the script file on disk.
    pub file: String,
    /// Cron expression; empty = manual runs only.
    #[serde(default)]
    pub schedule: String,
    /// Optional process whose working directory the script runs in.
    #[serde(default)]
    pub process: String,
}

/// Cron engine with second precision plus on-demand script execution.
/// Firings are independent tasks: one slow run of a script never delays
/// the next.
pub struct Scheduler {
    paths: Paths,
    engine: Arc<Engine>,
}

impl Scheduler {
    pub fn new(paths: Paths, engine: Arc<Engine>) -> Arc<Scheduler> {
        Arc::new(Scheduler { paths, engine })
    }

    fn script_path(&self, name: &str) -> PathBuf {
        self.paths.scripts_dir().join(format!("{name}.yaml"))
    }

    fn script_log_path(&self, name: &str) -> PathBuf {
        self.paths.script_logs_dir().join(format!("{name}.log"))
    }

    // ---------------- script records ----------------

    pub async fn add(&self, script: Script) -> Result<()> {
        if script.name.trim().is_empty()
            || !script
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(Error::InvalidArgument(format!(
                "invalid script name {:?}",
                script.name
            )));
        }
        if self.script_path(&script.name).exists() {
            return Err(Error::AlreadyExists(format!("script {}", script.name)));
        }
        if !Path::new(&script.file).exists() {
            return Err(Error::InvalidArgument(format!(
                "script file {} does not exist",
                script.file
            )));
        }
        if !script.schedule.is_empty() {
            Schedule::from_str(&normalize_cron_expr(&script.schedule)).map_err(|e| {
                Error::InvalidArgument(format!("invalid cron expression {:?}: {e}", script.schedule))
            })?;
        }
        if !script.process.is_empty()
            && self.engine.get(&script.process).await.is_err()
            && self.engine.store().load_descriptor(&script.process).is_err()
        {
            return Err(Error::InvalidArgument(format!(
                "unknown process {:?}",
                script.process
            )));
        }

        let raw = serde_yaml::to_string(&script).map_err(|e| {
            Error::os(format!("render script {}", script.name), std::io::Error::other(e))
        })?;
        let path = self.script_path(&script.name);
        std::fs::write(&path, raw).map_err(|e| Error::os(format!("write {}", path.display()), e))
    }

    pub fn get(&self, name: &str) -> Result<Script> {
        let path = self.script_path(name);
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("script {name}")))?;
        serde_yaml::from_str(&raw).map_err(|e| {
            Error::InvalidArgument(format!("malformed script {}: {e}", path.display()))
        })
    }

    pub fn list(&self) -> Result<Vec<Script>> {
        let dir = self.paths.scripts_dir();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::os(format!("read {}", dir.display()), e))?;
        let mut out = vec![];
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("yaml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(name) {
                Ok(s) => out.push(s),
                Err(e) => warn!("skipping script {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Delete the persisted record. An in-flight invocation completes.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.script_path(name);
        if !path.exists() {
            return Err(Error::NotFound(format!("script {name}")));
        }
        std::fs::remove_file(&path).map_err(|e| Error::os(format!("remove {}", path.display()), e))
    }

    // ---------------- execution ----------------

    /// Run a script to completion, appending combined output to its log.
    /// Errors iff the exit code is non-zero.
    pub async fn run(&self, name: &str) -> Result<()> {
        let script = self.get(name)?;
        let file = PathBuf::from(&script.file);
        if !file.exists() {
            return Err(Error::NotFound(format!("script file {}", file.display())));
        }

        let workdir = self.resolve_workdir(&script, &file).await;
        let log_path = self.script_log_path(name);
        let mut log = sys::open_append_log(&log_path)?;
        let _ = writeln!(
            log,
            "=== script '{name}' started at {} ===",
            Local::now().to_rfc3339()
        );
        let log_err = log
            .try_clone()
            .map_err(|e| Error::os(format!("dup log {}", log_path.display()), e))?;

        let (program, args) = interpreter_for(&file);
        let status = Command::new(program)
            .args(args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|e| Error::os(format!("run script {name}"), e))?;
        if status.success() {
            return Ok(());
        }
        Err(Error::Hook {
            what: format!("script {name}"),
            code: status.code().unwrap_or(-1),
        })
    }

    async fn resolve_workdir(&self, script: &Script, file: &Path) -> PathBuf {
        let file_dir = || {
            file.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };
        if script.process.is_empty() {
            return file_dir();
        }
        let desc = match self.engine.get(&script.process).await {
            Ok(record) => record.desc.clone(),
            Err(_) => match self.engine.store().load_descriptor(&script.process) {
                Ok(d) => d,
                Err(_) => return file_dir(),
            },
        };
        if desc.working_dir.is_empty() {
            file_dir()
        } else {
            PathBuf::from(&desc.working_dir)
        }
    }

    // ---------------- cron loop ----------------

    /// One tick per second; every persisted script whose schedule matches the
    /// current second is fired as its own task.
    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sched = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_fired: HashMap<String, i64> = HashMap::new();
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let now = match Local::now().with_nanosecond(0) {
                    Some(t) => t,
                    None => continue,
                };
                let scripts = match sched.list() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("scheduler: {e}");
                        continue;
                    }
                };
                for script in scripts {
                    if script.schedule.is_empty() {
                        continue;
                    }
                    let sec_key = now.timestamp();
                    if last_fired.get(&script.name).copied() == Some(sec_key) {
                        continue;
                    }
                    let schedule =
                        match Schedule::from_str(&normalize_cron_expr(&script.schedule)) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!("script {}: bad schedule: {e}", script.name);
                                continue;
                            }
                        };
                    let prev = now - chrono::Duration::seconds(1);
                    let due = schedule
                        .after(&prev)
                        .next()
                        .map(|dt| dt == now)
                        .unwrap_or(false);
                    if !due {
                        continue;
                    }
                    last_fired.insert(script.name.clone(), sec_key);

                    let sched2 = Arc::clone(&sched);
                    let name = script.name.clone();
                    tokio::spawn(async move {
                        match sched2.run(&name).await {
                            Ok(()) => info!("script {name} completed"),
                            Err(e) => warn!("script {name}: {e}"),
                        }
                    });
                }
            }
        })
    }
}

/// Accept standard 5-field cron by prepending seconds=0; 6+ fields pass
/// through unchanged.
pub fn normalize_cron_expr(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Interpreter resolution by file extension; unknown extensions are executed
/// directly.
fn interpreter_for(file: &Path) -> (String, Vec<String>) {
    let ext = file
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let path = file.display().to_string();
    match ext.as_str() {
        "sh" => ("/bin/sh".to_string(), vec![path]),
        "py" => ("python3".to_string(), vec![path]),
        "js" => ("node".to_string(), vec![path]),
        _ => (path, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_gets_seconds() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("*/5 * * * * *"), "*/5 * * * * *");
    }

    #[test]
    fn normalized_expressions_parse() {
        assert!(Schedule::from_str(&normalize_cron_expr("* * * * *")).is_ok());
        assert!(Schedule::from_str(&normalize_cron_expr("0 3 * * 1")).is_ok());
        assert!(Schedule::from_str(&normalize_cron_expr("not a cron")).is_err());
    }

    #[test]
    fn interpreter_by_extension() {
        let (p, a) = interpreter_for(Path::new("/opt/x.sh"));
        assert_eq!((p.as_str(), a.len()), ("/bin/sh", 1));
        let (p, _) = interpreter_for(Path::new("/opt/x.py"));
        assert_eq!(p, "python3");
        let (p, _) = interpreter_for(Path::new("/opt/x.js"));
        assert_eq!(p, "node");
        let (p, a) = interpreter_for(Path::new("/opt/tool"));
        assert_eq!(p, "/opt/tool");
        assert!(a.is_empty());
    }
}
