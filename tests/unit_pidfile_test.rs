use gyre::core::cycle::Cycle;
use gyre::core::engine::{Engine, EngineOptions};
use gyre::core::module::ModuleRegistry;
use gyre::core::pidfile::{create_pidfile, delete_pidfile};
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_conf(dir: &Path, pid: &Path, port: u16) -> PathBuf {
    let text = format!(
        "pid = {:?}\nerror_log = {:?}\n[[listen]]\naddr = \"127.0.0.1:{port}\"\n",
        pid,
        dir.join("error.log"),
    );
    let conf = dir.join("gyre.toml");
    std::fs::write(&conf, text).unwrap();
    conf
}

fn engine_for(dir: &TempDir, conf: &Path) -> (Arc<Engine>, Arc<Cycle>) {
    let bootstrap = Cycle::bootstrap(conf, dir.path());
    let engine = Engine::new(
        ModuleRegistry::new(),
        EngineOptions::default(),
        bootstrap.clone(),
    );
    (engine, bootstrap)
}

#[tokio::test]
async fn test_pid_file_written_with_pid_and_newline() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("gyre.pid");
    let conf = write_conf(dir.path(), &pid_path, free_port());
    let (engine, bootstrap) = engine_for(&dir, &conf);

    let cycle = engine.init_cycle(&bootstrap).unwrap().unwrap();
    // The transaction skipped the pid file because its predecessor was the
    // bootstrap cycle; the serving process writes it explicitly.
    assert!(!pid_path.exists());

    create_pidfile(false, false, &cycle, None).unwrap();
    let content = std::fs::read_to_string(&pid_path).unwrap();
    assert_eq!(content, format!("{}\n", std::process::id()));
}

#[tokio::test]
async fn test_pid_file_untouched_when_path_is_unchanged() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("gyre.pid");
    let conf = write_conf(dir.path(), &pid_path, free_port());
    let (engine, bootstrap) = engine_for(&dir, &conf);

    let c1 = engine.init_cycle(&bootstrap).unwrap().unwrap();
    create_pidfile(false, false, &c1, None).unwrap();

    // A sentinel value survives a reload with the same pid path only if
    // the file is genuinely left alone.
    std::fs::write(&pid_path, "sentinel\n").unwrap();
    let _c2 = engine.init_cycle(&c1).unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), "sentinel\n");
}

#[tokio::test]
async fn test_changed_pid_path_writes_new_and_deletes_old() {
    let dir = TempDir::new().unwrap();
    let pid1 = dir.path().join("gyre.pid");
    let conf = write_conf(dir.path(), &pid1, free_port());
    let (engine, bootstrap) = engine_for(&dir, &conf);

    let c1 = engine.init_cycle(&bootstrap).unwrap().unwrap();
    create_pidfile(false, false, &c1, None).unwrap();
    assert!(pid1.exists());

    let pid2 = dir.path().join("gyre2.pid");
    write_conf(dir.path(), &pid2, free_port());
    let _c2 = engine.init_cycle(&c1).unwrap().unwrap();

    assert!(pid2.exists());
    assert!(!pid1.exists());
    let content = std::fs::read_to_string(&pid2).unwrap();
    assert_eq!(content, format!("{}\n", std::process::id()));
}

#[tokio::test]
async fn test_delete_pidfile_removes_the_file() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("gyre.pid");
    let conf = write_conf(dir.path(), &pid_path, free_port());
    let (engine, bootstrap) = engine_for(&dir, &conf);

    let cycle = engine.init_cycle(&bootstrap).unwrap().unwrap();
    create_pidfile(false, false, &cycle, None).unwrap();
    assert!(pid_path.exists());

    delete_pidfile(false, &cycle);
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_bootstrap_cycle_has_no_pid_file_to_delete() {
    let dir = TempDir::new().unwrap();
    let conf = write_conf(dir.path(), &dir.path().join("gyre.pid"), free_port());
    let bootstrap = Cycle::bootstrap(&conf, dir.path());

    // Must be a no-op rather than a panic or a stray unlink.
    delete_pidfile(false, &bootstrap);
}

#[test]
fn test_test_config_mode_does_not_truncate() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("gyre.pid");
    std::fs::write(&pid_path, "12345\n").unwrap();
    let conf = write_conf(dir.path(), &pid_path, free_port());

    let bootstrap = Cycle::bootstrap(conf, dir.path());
    let engine = Engine::new(
        ModuleRegistry::new(),
        EngineOptions {
            test_config: true,
            ..EngineOptions::default()
        },
        bootstrap.clone(),
    );

    assert!(engine.init_cycle(&bootstrap).unwrap().is_none());
    assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), "12345\n");
}
