use crate::config::{self, Paths};
use crate::descriptor::ProcessDescriptor;
use crate::engine::Engine;
use crate::error::Error;
use crate::logs::LogFollower;
use crate::registry::ProcessSnapshot;
use crate::scheduler::{Scheduler, Script};
use crate::shell::ShellSession;
use crate::{api, build_info, install};
use clap::{Parser, Subcommand};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Parser)]
#[command(name = "gem", version, about = "gem process supervisor")]
pub struct Args {
    /// Data directory (default: ~/.gem)
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start a process from a persisted descriptor name or a YAML file
    Start {
        /// Process name, or path to a descriptor YAML file
        target: String,
    },
    /// Stop a process (SIGTERM, or SIGKILL with --force)
    Stop {
        name: String,
        #[arg(long = "force")]
        force: bool,
    },
    /// Stop a process, wait its restart delay, start it again
    Restart { name: String },
    /// List managed processes
    List,
    /// Show one process in detail
    Info { name: String },
    /// Show the tail of a process log stream
    Logs {
        name: String,
        #[arg(short = 'n', long = "lines", default_value_t = 50)]
        lines: i64,
        /// stdout or stderr
        #[arg(long = "stream", default_value = "stdout")]
        stream: String,
        /// Keep printing lines as they are appended
        #[arg(short = 'f', long = "follow")]
        follow: bool,
    },
    /// Open an interactive shell next to a running process (Ctrl-] detaches)
    Shell { name: String },
    /// Manage automation scripts
    #[command(subcommand)]
    Script(ScriptCmd),
    /// HTTP API server
    #[command(subcommand)]
    Api(ApiCmd),
    /// Install gem as a systemd service
    Install,
    /// Print build info
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ScriptCmd {
    /// Register a script, optionally on a cron schedule
    Add {
        name: String,
        file: PathBuf,
        /// Cron expression (5 or 6 fields; seconds optional)
        #[arg(long = "schedule")]
        schedule: Option<String>,
        /// Associated process whose working directory the script runs in
        #[arg(long = "process")]
        process: Option<String>,
    },
    /// List registered scripts
    List,
    /// Run a script now
    Run { name: String },
    /// Remove a script registration
    Remove { name: String },
}

#[derive(Debug, Subcommand)]
pub enum ApiCmd {
    /// Run the API server in the foreground (recovers state, autostarts,
    /// schedules scripts)
    Start {
        #[arg(long = "port")]
        port: Option<u16>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if matches!(args.cmd, Cmd::Version) {
        println!("{}", build_info::banner());
        return Ok(());
    }

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(config::default_data_dir);
    let paths = Paths::new(data_dir);
    let cfg = config::load_or_init(&paths)?;
    init_tracing(&cfg.log_level);

    let engine = Engine::new(paths.clone());
    engine.recover().await?;
    let scheduler = Scheduler::new(paths.clone(), Arc::clone(&engine));

    match args.cmd {
        Cmd::Start { target } => {
            let desc = resolve_descriptor(&engine, &target)?;
            let snap = engine.start(desc).await?;
            if snap.instances > 0 {
                println!("started cluster {} with {} instances", snap.name, snap.instances);
            } else {
                println!("started {} (pid {})", snap.name, snap.pid);
            }
            Ok(())
        }
        Cmd::Stop { name, force } => {
            engine.stop(&name, force).await?;
            if wait_gone(&engine, &name, Duration::from_secs(30)).await {
                println!("stopped {name}");
            } else {
                println!("stop signalled to {name}; it has not exited yet");
            }
            Ok(())
        }
        Cmd::Restart { name } => {
            engine.restart(&name).await?;
            println!("restarted {name}");
            Ok(())
        }
        Cmd::List => {
            let records = engine.list().await;
            if records.is_empty() {
                println!("(no processes)");
                return Ok(());
            }
            let snapshots: Vec<ProcessSnapshot> =
                records.iter().map(|r| r.snapshot()).collect();
            println!("{}", render_process_table(&snapshots));
            Ok(())
        }
        Cmd::Info { name } => {
            let record = engine.get(&name).await?;
            println!("{}", serde_json::to_string_pretty(&record.snapshot())?);
            Ok(())
        }
        Cmd::Logs {
            name,
            lines,
            stream,
            follow,
        } => {
            if follow {
                let record = engine.get(&name).await?;
                let path = engine.log_path(&record.desc, &stream)?;
                let mut follower = LogFollower::open(&path, lines.max(0) as usize)?;
                loop {
                    println!("{}", follower.next_line().await?);
                }
            }
            for line in engine.logs(&name, &stream, lines).await? {
                println!("{line}");
            }
            Ok(())
        }
        Cmd::Shell { name } => run_shell(&engine, &name).await,
        Cmd::Script(cmd) => run_script_cmd(&scheduler, cmd).await,
        Cmd::Api(ApiCmd::Start { port }) => {
            let port = port.unwrap_or(cfg.api_port);
            let started = engine.autostart().await?;
            if started > 0 {
                println!("autostarted {started} process(es)");
            }
            let _cron = scheduler.spawn_loop();
            api::serve(engine, port).await
        }
        Cmd::Install => install::install(),
        Cmd::Version => unreachable!("handled before setup"),
    }
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `gem start foo` takes either a known descriptor name or a YAML file path.
fn resolve_descriptor(engine: &Arc<Engine>, target: &str) -> anyhow::Result<ProcessDescriptor> {
    let path = PathBuf::from(target);
    let looks_like_file = path.exists()
        && matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("yaml") | Some("yml")
        );
    if looks_like_file {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let desc: ProcessDescriptor = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        return Ok(desc);
    }
    Ok(engine.store().load_descriptor(target)?)
}

async fn wait_gone(engine: &Arc<Engine>, name: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match engine.get(name).await {
            Err(Error::NotFound(_)) => return true,
            // Terminal leftovers count as stopped for the CLI.
            Ok(r) if r.status().is_terminal() => return true,
            _ => {}
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn run_script_cmd(scheduler: &Arc<Scheduler>, cmd: ScriptCmd) -> anyhow::Result<()> {
    match cmd {
        ScriptCmd::Add {
            name,
            file,
            schedule,
            process,
        } => {
            // Store the absolute path so scheduled runs are cwd-independent.
            let file = std::fs::canonicalize(&file)
                .map_err(|e| anyhow::anyhow!("script file {}: {e}", file.display()))?;
            scheduler
                .add(Script {
                    name: name.clone(),
                    file: file.display().to_string(),
                    schedule: schedule.unwrap_or_default(),
                    process: process.unwrap_or_default(),
                })
                .await?;
            println!("added script {name}");
            Ok(())
        }
        ScriptCmd::List => {
            let scripts = scheduler.list()?;
            if scripts.is_empty() {
                println!("(no scripts)");
                return Ok(());
            }
            for s in scripts {
                let schedule = if s.schedule.is_empty() {
                    "manual".to_string()
                } else {
                    s.schedule.clone()
                };
                let process = if s.process.is_empty() { "-" } else { &s.process };
                println!("{}  {}  schedule={schedule}  process={process}", s.name, s.file);
            }
            Ok(())
        }
        ScriptCmd::Run { name } => {
            scheduler.run(&name).await?;
            println!("script {name} completed");
            Ok(())
        }
        ScriptCmd::Remove { name } => {
            scheduler.remove(&name)?;
            println!("removed script {name}");
            Ok(())
        }
    }
}

// ---------------- interactive shell ----------------

async fn run_shell(engine: &Arc<Engine>, name: &str) -> anyhow::Result<()> {
    let session = engine.attach_shell(name).await?;
    if let Some((rows, cols)) = terminal_size() {
        let _ = session.resize(rows, cols);
    }

    let saved = enable_raw_mode()?;
    let result = shell_loop(&session).await;
    restore_mode(&saved);
    let _ = engine.detach_shell(name).await;
    println!();
    result
}

async fn shell_loop(session: &ShellSession) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut winch = signal(SignalKind::window_change())?;
    let mut inbuf = [0u8; 1024];
    let mut outbuf = [0u8; 4096];
    loop {
        tokio::select! {
            read = session.read(&mut outbuf) => {
                match read {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(n) => {
                        stdout.write_all(&outbuf[..n]).await?;
                        stdout.flush().await?;
                    }
                }
            }
            read = stdin.read(&mut inbuf) => {
                match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        // Ctrl-] detaches without killing the target.
                        if inbuf[..n].contains(&0x1d) {
                            return Ok(());
                        }
                        session.write_all(&inbuf[..n]).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = winch.recv() => {
                if let Some((rows, cols)) = terminal_size() {
                    let _ = session.resize(rows, cols);
                }
            }
        }
    }
}

fn enable_raw_mode() -> anyhow::Result<Termios> {
    let stdin = std::io::stdin();
    let saved = tcgetattr(&stdin).map_err(|e| anyhow::anyhow!("tcgetattr: {e}"))?;
    let mut raw = saved.clone();
    cfmakeraw(&mut raw);
    tcsetattr(&stdin, SetArg::TCSANOW, &raw).map_err(|e| anyhow::anyhow!("tcsetattr: {e}"))?;
    Ok(saved)
}

fn restore_mode(saved: &Termios) {
    let _ = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, saved);
}

fn terminal_size() -> Option<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let r = unsafe { libc::ioctl(0, libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
    if r == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
        Some((ws.ws_row, ws.ws_col))
    } else {
        None
    }
}

// ---------------- list rendering ----------------

fn render_process_table(snapshots: &[ProcessSnapshot]) -> String {
    let headers = ["name", "status", "pid", "uptime", "restarts", "command"];
    let mut rows: Vec<Vec<String>> = vec![];
    for s in snapshots {
        let pid = if s.pid > 0 {
            s.pid.to_string()
        } else {
            "-".to_string()
        };
        let uptime = if matches!(s.status.as_str(), "running" | "restarting") {
            fmt_uptime_secs(s.uptime_secs)
        } else {
            "-".to_string()
        };
        let command = if s.instances > 0 {
            format!("[cluster x{}] {}", s.instances, s.command)
        } else {
            s.command.clone()
        };
        rows.push(vec![
            s.name.clone(),
            s.status.to_string(),
            pid,
            uptime,
            s.restarts.to_string(),
            command,
        ]);
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let line = |cells: &[String]| {
        let mut out = String::new();
        for (i, w) in widths.iter().enumerate() {
            let cell = cells.get(i).map(String::as_str).unwrap_or("");
            out.push_str(cell);
            if i + 1 < widths.len() {
                out.push_str(&" ".repeat(w - cell.len() + 2));
            }
        }
        out
    };

    let mut out = line(&headers.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    out.push('\n');
    for row in &rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn fmt_uptime_secs(mut s: i64) -> String {
    if s < 0 {
        return "-".to_string();
    }
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(fmt_uptime_secs(5), "5s");
        assert_eq!(fmt_uptime_secs(65), "1m05s");
        assert_eq!(fmt_uptime_secs(3_700), "1h01m");
        assert_eq!(fmt_uptime_secs(90_000), "1d01h");
        assert_eq!(fmt_uptime_secs(-1), "-");
    }

    #[test]
    fn table_aligns_columns() {
        use crate::registry::Status;
        let snaps = vec![ProcessSnapshot {
            name: "web".into(),
            status: Status::Running,
            pid: 42,
            started_at: String::new(),
            uptime_secs: 5,
            restarts: 0,
            command: "/bin/sleep".into(),
            args: vec![],
            instances: 0,
            children: vec![],
        }];
        let table = render_process_table(&snaps);
        let mut lines = table.lines();
        assert!(lines.next().unwrap().starts_with("name"));
        assert!(lines.next().unwrap().contains("running"));
    }
}
