use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gem::config::Paths;
use gem::descriptor::{ProcessDescriptor, RestartPolicy};
use gem::engine::Engine;
use gem::error::Error;
use gem::registry::Status;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_data_dir(name: &str) -> PathBuf {
    let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("gem-it-{}-{n}-{name}", std::process::id()));
    dir
}

fn test_engine(name: &str) -> (Arc<Engine>, PathBuf) {
    let dir = temp_data_dir(name);
    let paths = Paths::new(&dir);
    paths.ensure_layout().unwrap();
    (Engine::new(paths), dir)
}

fn sleeper(name: &str) -> ProcessDescriptor {
    let mut d = ProcessDescriptor::new(name, "/bin/sleep");
    d.args = vec!["1000".to_string()];
    d.restart_policy = RestartPolicy::Never;
    d
}

async fn wait_gone(engine: &Arc<Engine>, name: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if engine.get(name).await.is_err() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_status(engine: &Arc<Engine>, name: &str, want: Status, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if engine
            .get(name)
            .await
            .map(|r| r.status() == want)
            .unwrap_or(false)
        {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// --- happy start/stop ---

#[tokio::test]
async fn start_then_stop_removes_record_and_pid_file() {
    let (engine, dir) = test_engine("start-stop");

    let snap = engine.start(sleeper("echo")).await.unwrap();
    assert_eq!(snap.status, Status::Running);
    assert!(snap.pid > 0);
    assert_eq!(snap.restarts, 0);
    assert!(engine.store().read_pid("echo").is_ok());

    engine.stop("echo", false).await.unwrap();
    assert!(wait_gone(&engine, "echo", Duration::from_secs(2)).await);
    assert!(matches!(
        engine.store().read_pid("echo"),
        Err(Error::NotFound(_))
    ));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn force_stop_also_cleans_up() {
    let (engine, dir) = test_engine("force-stop");
    engine.start(sleeper("svc")).await.unwrap();

    engine.stop("svc", true).await.unwrap();
    assert!(wait_gone(&engine, "svc", Duration::from_secs(2)).await);
    assert!(engine.store().read_pid("svc").is_err());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn stop_unknown_is_not_found() {
    let (engine, dir) = test_engine("stop-unknown");
    assert!(matches!(
        engine.stop("ghost", false).await,
        Err(Error::NotFound(_))
    ));
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn duplicate_start_is_refused() {
    let (engine, dir) = test_engine("duplicate");
    engine.start(sleeper("svc")).await.unwrap();
    assert!(matches!(
        engine.start(sleeper("svc")).await,
        Err(Error::AlreadyExists(_))
    ));
    engine.stop("svc", true).await.unwrap();
    let _ = std::fs::remove_dir_all(dir);
}

// --- restart policy ---

#[tokio::test]
async fn on_failure_cap_spawns_max_plus_one() {
    let (engine, dir) = test_engine("restart-cap");
    let marker = dir.join("runs.txt");

    let mut d = ProcessDescriptor::new("flaky", "/bin/sh");
    d.args = vec![
        "-c".to_string(),
        format!("echo run >> {}; exit 1", marker.display()),
    ];
    d.restart_policy = RestartPolicy::OnFailure;
    d.max_restarts = 3;
    d.restart_delay = 0;

    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "flaky", Status::Failed, Duration::from_secs(10)).await);

    let record = engine.get("flaky").await.unwrap();
    assert_eq!(record.snapshot().restarts, 3);
    let runs = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(runs.lines().count(), 4, "expected 4 spawns, got: {runs:?}");
    // Terminal records keep no pid file.
    assert!(engine.store().read_pid("flaky").is_err());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn on_failure_leaves_clean_exit_stopped() {
    let (engine, dir) = test_engine("clean-exit");
    let mut d = ProcessDescriptor::new("oneshot", "/bin/true");
    d.restart_policy = RestartPolicy::OnFailure;

    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "oneshot", Status::Stopped, Duration::from_secs(2)).await);
    assert_eq!(engine.get("oneshot").await.unwrap().snapshot().restarts, 0);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn never_policy_does_not_respawn() {
    let (engine, dir) = test_engine("never");
    let marker = dir.join("runs.txt");

    let mut d = ProcessDescriptor::new("once", "/bin/sh");
    d.args = vec![
        "-c".to_string(),
        format!("echo run >> {}; exit 3", marker.display()),
    ];
    d.restart_policy = RestartPolicy::Never;

    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "once", Status::Failed, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        std::fs::read_to_string(&marker).unwrap().lines().count(),
        1
    );
    assert_eq!(engine.get("once").await.unwrap().snapshot().restarts, 0);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn terminal_record_can_be_started_again() {
    let (engine, dir) = test_engine("restartable");
    let mut d = ProcessDescriptor::new("job", "/bin/true");
    d.restart_policy = RestartPolicy::OnFailure;

    engine.start(d.clone()).await.unwrap();
    assert!(wait_status(&engine, "job", Status::Stopped, Duration::from_secs(2)).await);

    // A terminal record does not block a fresh start.
    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "job", Status::Stopped, Duration::from_secs(2)).await);

    let _ = std::fs::remove_dir_all(dir);
}

// --- environment ---

#[tokio::test]
async fn descriptor_env_overrides_inherited() {
    let (engine, dir) = test_engine("env");
    let marker = dir.join("env.txt");

    let mut d = ProcessDescriptor::new("envcheck", "/bin/sh");
    d.args = vec![
        "-c".to_string(),
        format!("echo $GEM_IT_VAR > {}", marker.display()),
    ];
    d.restart_policy = RestartPolicy::Never;
    d.env.insert("GEM_IT_VAR".to_string(), "from-descriptor".to_string());
    std::env::set_var("GEM_IT_VAR", "from-supervisor");

    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "envcheck", Status::Stopped, Duration::from_secs(2)).await);
    assert_eq!(
        std::fs::read_to_string(&marker).unwrap().trim(),
        "from-descriptor"
    );

    let _ = std::fs::remove_dir_all(dir);
}

// --- cluster ---

#[tokio::test]
async fn cluster_fan_out_and_teardown() {
    let (engine, dir) = test_engine("cluster");
    let mut d = sleeper("web");
    d.cluster.instances = 3;

    let snap = engine.start(d).await.unwrap();
    assert_eq!(snap.instances, 3);

    let names: Vec<String> = engine
        .list()
        .await
        .iter()
        .map(|r| r.desc.name.clone())
        .collect();
    assert!(names.contains(&"web".to_string()));
    for i in 0..3 {
        assert!(names.contains(&format!("web-worker-{i}")));
    }
    let master = engine.get("web").await.unwrap();
    assert_eq!(master.children.len(), 3);
    assert_eq!(master.pid(), 0);

    engine.stop("web", true).await.unwrap();
    assert!(wait_gone(&engine, "web", Duration::from_secs(5)).await);
    for i in 0..3 {
        assert!(engine.get(&format!("web-worker-{i}")).await.is_err());
    }

    let _ = std::fs::remove_dir_all(dir);
}

// --- recovery ---

#[tokio::test]
async fn recovery_reattaches_live_pid() {
    let (engine, dir) = test_engine("recovery");
    let snap = engine.start(sleeper("svc")).await.unwrap();
    let pid = snap.pid;

    // A fresh engine over the same data dir stands in for a restarted
    // supervisor process.
    let engine2 = Engine::new(Paths::new(&dir));
    let recovered = engine2.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let record = engine2.get("svc").await.unwrap();
    assert_eq!(record.status(), Status::Running);
    assert_eq!(record.pid(), pid);
    assert_eq!(record.desc.command, "/bin/sleep");

    engine2.stop("svc", true).await.unwrap();
    assert!(wait_gone(&engine2, "svc", Duration::from_secs(3)).await);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn recovery_drops_stale_pid_files() {
    let (engine, dir) = test_engine("stale-pid");
    let d = sleeper("ghost");
    engine.store().save_descriptor(&d).unwrap();
    // A pid that cannot be alive: pid_max on Linux caps below this.
    engine.store().write_pid("ghost", 0x3ffffff).unwrap();

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered, 0);
    assert!(engine.store().read_pid("ghost").is_err());
    assert!(engine.get("ghost").await.is_err());

    let _ = std::fs::remove_dir_all(dir);
}

// --- logs ---

#[tokio::test]
async fn logs_tail_reads_child_output() {
    let (engine, dir) = test_engine("logs");
    let mut d = ProcessDescriptor::new("printer", "/bin/sh");
    d.args = vec![
        "-c".to_string(),
        "echo out-line; echo err-line >&2".to_string(),
    ];
    d.restart_policy = RestartPolicy::Never;

    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "printer", Status::Stopped, Duration::from_secs(2)).await);

    let out = engine.logs("printer", "stdout", 10).await.unwrap();
    assert!(out.contains(&"out-line".to_string()), "stdout: {out:?}");
    let err = engine.logs("printer", "stderr", 10).await.unwrap();
    assert!(err.contains(&"err-line".to_string()), "stderr: {err:?}");

    assert!(matches!(
        engine.logs("printer", "nope", 10).await,
        Err(Error::InvalidArgument(_))
    ));

    let _ = std::fs::remove_dir_all(dir);
}

// --- hooks ---

#[tokio::test]
async fn failing_pre_start_aborts_and_leaves_registry_unchanged() {
    let (engine, dir) = test_engine("hook-abort");
    let mut d = sleeper("hooked");
    d.hooks.pre_start = "exit 9".to_string();

    let err = engine.start(d).await.unwrap_err();
    assert!(matches!(err, Error::Hook { code: 9, .. }));
    assert!(engine.get("hooked").await.is_err());
    assert!(engine.store().read_pid("hooked").is_err());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn hooks_observe_descriptor_env() {
    let (engine, dir) = test_engine("hook-env");
    let marker = dir.join("hook.txt");

    let mut d = sleeper("svc");
    d.hooks.pre_start = format!("echo pre-$GEM_HOOK_VAR >> {}", marker.display());
    d.env
        .insert("GEM_HOOK_VAR".to_string(), "value".to_string());

    engine.start(d).await.unwrap();
    let content = std::fs::read_to_string(&marker).unwrap();
    assert!(content.contains("pre-value"));

    engine.stop("svc", true).await.unwrap();
    let _ = std::fs::remove_dir_all(dir);
}

// --- shell attachment ---

#[tokio::test]
async fn shell_refused_for_master_allowed_for_worker() {
    let (engine, dir) = test_engine("shell");
    let mut d = sleeper("web");
    d.cluster.instances = 2;
    engine.start(d).await.unwrap();

    assert!(matches!(
        engine.attach_shell("web").await,
        Err(Error::PreconditionFailed(_))
    ));

    let session = engine.attach_shell("web-worker-0").await.unwrap();
    session.close();
    engine.detach_shell("web-worker-0").await.unwrap();

    engine.stop("web", true).await.unwrap();
    assert!(wait_gone(&engine, "web", Duration::from_secs(5)).await);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn shell_refused_for_terminal_record() {
    let (engine, dir) = test_engine("shell-stopped");
    let mut d = ProcessDescriptor::new("done", "/bin/true");
    d.restart_policy = RestartPolicy::OnFailure;
    engine.start(d).await.unwrap();
    assert!(wait_status(&engine, "done", Status::Stopped, Duration::from_secs(2)).await);

    assert!(matches!(
        engine.attach_shell("done").await,
        Err(Error::PreconditionFailed(_))
    ));

    let _ = std::fs::remove_dir_all(dir);
}

// --- descriptor round-trip through the store ---

#[tokio::test]
async fn start_persists_descriptor_for_round_trip() {
    let (engine, dir) = test_engine("round-trip");
    let mut d = sleeper("svc");
    d.env.insert("A".to_string(), "1".to_string());
    d.max_restarts = 7;
    engine.start(d).await.unwrap();

    let loaded = engine.store().load_descriptor("svc").unwrap();
    assert_eq!(loaded.max_restarts, 7);
    assert_eq!(loaded.env.get("A").map(String::as_str), Some("1"));
    assert_eq!(loaded.restart_policy, RestartPolicy::Never);

    engine.stop("svc", true).await.unwrap();
    let _ = std::fs::remove_dir_all(dir);
}
