use crate::error::{Error, Result};
use chrono::{DateTime, Local, TimeZone};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Thin facade over the process-related OS surface (spawn, signal, wait,
/// identity lookup, /proc). Everything the engine does to the outside world
/// funnels through here.

/// True when the kernel acknowledges the PID (signal 0 delivery).
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Deliver the stop signal: SIGTERM, or SIGKILL when `force` is set.
pub fn send_stop_signal(pid: i32, force: bool) -> Result<()> {
    let sig = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    kill(Pid::from_raw(pid), sig)
        .map_err(|e| Error::os_errno(format!("signal {sig} to pid {pid}"), e))
}

/// Resolve a username (and optional group name) into numeric ids.
/// An empty group falls back to the user's primary group.
pub fn resolve_user_group(user: &str, group: &str) -> Result<(u32, u32)> {
    let u = users::get_user_by_name(user)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown user {user:?}")))?;
    let gid = if group.is_empty() {
        u.primary_group_id()
    } else {
        users::get_group_by_name(group)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown group {group:?}")))?
            .gid()
    };
    Ok((u.uid(), gid))
}

/// Open a log file for appending, creating parent directories.
pub fn open_append_log(path: &Path) -> Result<fs::File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::os(format!("create {}", dir.display()), e))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::os(format!("open log {}", path.display()), e))
}

/// Run a lifecycle hook as its own `sh -c` child and wait for it.
///
/// Hooks never execute inside the supervisor's address space; failure is
/// reported through the exit code alone.
pub async fn run_hook(
    what: &str,
    script: &str,
    cwd: &str,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if !cwd.is_empty() {
        cmd.current_dir(cwd);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    let status = cmd
        .status()
        .await
        .map_err(|e| Error::os(format!("spawn {what} hook"), e))?;
    if status.success() {
        return Ok(());
    }
    Err(Error::Hook {
        what: format!("{what} hook"),
        code: status.code().unwrap_or(-1),
    })
}

// ---------------- /proc-derived process start time ----------------

/// Wall-clock start time of an arbitrary PID, from the kernel's accounting.
///
/// `/proc/<pid>/stat` field 22 is the start time in clock ticks since boot;
/// boot time comes from the `btime` line of `/proc/stat`. Returns None on
/// any parse failure so callers can fall back to "now".
pub fn process_start_time(pid: i32) -> Option<DateTime<Local>> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 2..];
    // starttime is field 22 overall, i.e. field 20 after pid and comm.
    let start_ticks: u64 = rest.split_whitespace().nth(19)?.parse().ok()?;

    let boot = fs::read_to_string("/proc/stat").ok()?;
    let btime: i64 = boot
        .lines()
        .find_map(|l| l.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        return None;
    }
    let started = btime + (start_ticks / hz as u64) as i64;
    Local.timestamp_opt(started, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_alive_for_self_and_not_for_garbage() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-5));
    }

    #[test]
    fn own_start_time_is_in_the_past() {
        let t = process_start_time(std::process::id() as i32).expect("own /proc entry");
        assert!(t <= Local::now());
    }

    #[tokio::test]
    async fn hook_failure_carries_exit_code() {
        let env = BTreeMap::new();
        let err = run_hook("pre_start", "exit 7", "", &env).await.unwrap_err();
        match err {
            Error::Hook { code, .. } => assert_eq!(code, 7),
            other => panic!("unexpected error: {other}"),
        }
        assert!(run_hook("pre_start", "true", "", &env).await.is_ok());
    }
}
