use crate::config::Paths;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ---------------- Restart policy ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure
    }
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "never",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Always => "always",
        }
    }
}

// ---------------- Descriptor sections ----------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// 0 or 1 = single process, >= 2 = cluster expansion.
    #[serde(default)]
    pub instances: u32,
    /// "fork" or "cluster"; informational only.
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Absolute stdout log path; empty = `<logs>/<name>.out.log`.
    #[serde(default)]
    pub stdout: String,
    /// Absolute stderr log path; empty = `<logs>/<name>.err.log`.
    #[serde(default)]
    pub stderr: String,
    // Rotation knobs are persisted for compatibility but not acted on.
    #[serde(default)]
    pub rotate: bool,
    #[serde(default)]
    pub max_size: String,
    #[serde(default)]
    pub max_files: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSettings {
    #[serde(default)]
    pub pre_start: String,
    #[serde(default)]
    pub post_start: String,
    #[serde(default)]
    pub pre_stop: String,
    #[serde(default)]
    pub post_stop: String,
}

/// Durable, declarative definition of one supervised process.
///
/// The YAML/JSON field names are the wire schema: they appear both in
/// `descriptors/<name>.yaml` and in `POST /processes` bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub name: String,

    #[serde(rename = "cmd")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory; empty = inherit the supervisor's.
    #[serde(default, rename = "cwd")]
    pub working_dir: String,

    /// Merged onto the supervisor's environment, overriding duplicates.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, rename = "restart")]
    pub restart_policy: RestartPolicy,

    /// 0 = unlimited.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Seconds to wait between exit and respawn.
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub log: LogSettings,

    #[serde(default, rename = "autostart")]
    pub auto_start: bool,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub group: String,

    #[serde(default, rename = "scripts")]
    pub hooks: HookSettings,
}

fn default_max_restarts() -> u32 {
    10
}

fn default_restart_delay() -> u64 {
    3
}

impl ProcessDescriptor {
    /// Minimal descriptor used by cluster expansion and tests.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: vec![],
            working_dir: String::new(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            max_restarts: default_max_restarts(),
            restart_delay: default_restart_delay(),
            cluster: ClusterSettings::default(),
            log: LogSettings::default(),
            auto_start: false,
            user: String::new(),
            group: String::new(),
            hooks: HookSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidArgument("name must not be empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(Error::InvalidArgument(format!(
                "invalid name {:?} (allowed: letters, digits, '_', '.', '-')",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "process {}: cmd must not be empty",
                self.name
            )));
        }
        if !self.working_dir.is_empty() && !PathBuf::from(&self.working_dir).is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "process {}: cwd must be absolute (got {:?})",
                self.name, self.working_dir
            )));
        }
        Ok(())
    }

    /// True when this descriptor expands into a worker fleet on start.
    pub fn is_cluster(&self) -> bool {
        self.cluster.instances >= 2
    }

    /// Descriptor for worker `i`, with cluster expansion disabled.
    pub fn worker(&self, i: u32) -> ProcessDescriptor {
        let mut w = self.clone();
        w.name = worker_name(&self.name, i);
        w.cluster.instances = 0;
        w.auto_start = false;
        w
    }

    /// Stdout log path, defaulting under the data-dir logs directory.
    pub fn stdout_log(&self, paths: &Paths) -> PathBuf {
        if self.log.stdout.is_empty() {
            paths.logs_dir().join(format!("{}.out.log", self.name))
        } else {
            PathBuf::from(&self.log.stdout)
        }
    }

    /// Stderr log path, defaulting under the data-dir logs directory.
    pub fn stderr_log(&self, paths: &Paths) -> PathBuf {
        if self.log.stderr.is_empty() {
            paths.logs_dir().join(format!("{}.err.log", self.name))
        } else {
            PathBuf::from(&self.log.stderr)
        }
    }
}

// ---------------- Cluster worker naming ----------------

pub fn worker_name(parent: &str, i: u32) -> String {
    format!("{parent}-worker-{i}")
}

/// True for names of the form `<parent>-worker-<digits>`.
pub fn is_cluster_worker(name: &str) -> bool {
    let Some(idx) = name.rfind("-worker-") else {
        return false;
    };
    let digits = &name[idx + "-worker-".len()..];
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_schema() {
        let d: ProcessDescriptor = serde_yaml::from_str("name: web\ncmd: /bin/true\n").unwrap();
        assert_eq!(d.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(d.max_restarts, 10);
        assert_eq!(d.restart_delay, 3);
        assert_eq!(d.cluster.instances, 0);
        assert!(!d.auto_start);
    }

    #[test]
    fn restart_policy_spellings() {
        let d: ProcessDescriptor =
            serde_yaml::from_str("name: a\ncmd: /bin/true\nrestart: on-failure\n").unwrap();
        assert_eq!(d.restart_policy, RestartPolicy::OnFailure);
        let d: ProcessDescriptor =
            serde_yaml::from_str("name: a\ncmd: /bin/true\nrestart: always\n").unwrap();
        assert_eq!(d.restart_policy, RestartPolicy::Always);
        let d: ProcessDescriptor =
            serde_yaml::from_str("name: a\ncmd: /bin/true\nrestart: never\n").unwrap();
        assert_eq!(d.restart_policy, RestartPolicy::Never);
    }

    #[test]
    fn validate_rejects_bad_names() {
        let mut d = ProcessDescriptor::new("ok_name-1.2", "/bin/true");
        assert!(d.validate().is_ok());
        d.name = "bad name".into();
        assert!(matches!(d.validate(), Err(Error::InvalidArgument(_))));
        d.name = String::new();
        assert!(matches!(d.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn validate_rejects_empty_cmd_and_relative_cwd() {
        let mut d = ProcessDescriptor::new("a", "");
        assert!(d.validate().is_err());
        d.command = "/bin/true".into();
        d.working_dir = "relative/path".into();
        assert!(d.validate().is_err());
    }

    #[test]
    fn worker_names_round_trip() {
        assert_eq!(worker_name("web", 2), "web-worker-2");
        assert!(is_cluster_worker("web-worker-0"));
        assert!(is_cluster_worker("web-worker-12"));
        // The trailing index is required; a bare suffix is not a worker.
        assert!(!is_cluster_worker("web-worker-"));
        assert!(!is_cluster_worker("web-worker-x"));
        assert!(!is_cluster_worker("web"));
    }

    #[test]
    fn worker_descriptor_does_not_recurse() {
        let mut d = ProcessDescriptor::new("web", "/bin/sleep");
        d.cluster.instances = 3;
        d.auto_start = true;
        let w = d.worker(1);
        assert_eq!(w.name, "web-worker-1");
        assert_eq!(w.cluster.instances, 0);
        assert!(!w.is_cluster());
        assert!(!w.auto_start);
    }

    #[test]
    fn env_round_trips_through_yaml() {
        let yaml = "name: a\ncmd: /bin/true\nenv:\n  FOO: bar\n  BAZ: qux\n";
        let d: ProcessDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(d.env.get("FOO").map(String::as_str), Some("bar"));
        let out = serde_yaml::to_string(&d).unwrap();
        let d2: ProcessDescriptor = serde_yaml::from_str(&out).unwrap();
        assert_eq!(d.env, d2.env);
    }
}
