use gyre::core::cycle::Cycle;
use gyre::core::engine::{Engine, EngineOptions};
use gyre::core::module::ModuleRegistry;
use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_engine(dir: &TempDir, conf_text: &str) -> (Arc<Engine>, Arc<Cycle>, std::path::PathBuf) {
    let conf = dir.path().join("gyre.toml");
    std::fs::write(&conf, conf_text).unwrap();

    let bootstrap = Cycle::bootstrap(&conf, dir.path());
    let engine = Engine::new(
        ModuleRegistry::new(),
        EngineOptions {
            test_config: true,
            ..EngineOptions::default()
        },
        bootstrap.clone(),
    );
    (engine, bootstrap, conf)
}

fn conf_text(dir: &Path, port: u16) -> String {
    format!(
        "pid = {:?}\nerror_log = {:?}\n[[listen]]\naddr = \"127.0.0.1:{port}\"\n",
        dir.join("gyre.pid"),
        dir.join("error.log"),
    )
}

#[test]
fn test_dry_run_binds_nothing_and_returns_no_cycle() {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let (engine, bootstrap, _) = test_engine(&dir, &conf_text(dir.path(), port));

    let outcome = engine.init_cycle(&bootstrap).unwrap();
    assert!(outcome.is_none());

    // The port was validated but never bound.
    assert!(StdTcpListener::bind(("127.0.0.1", port)).is_ok());
    // The current generation is still the bootstrap cycle.
    assert!(Arc::ptr_eq(&engine.current(), &bootstrap));
}

#[test]
fn test_dry_run_still_opens_and_releases_log_files() {
    let dir = TempDir::new().unwrap();
    let (engine, bootstrap, _) = test_engine(&dir, &conf_text(dir.path(), free_port()));

    engine.init_cycle(&bootstrap).unwrap();

    // Opening the log is part of the validation, so the file exists, but
    // nothing holds it afterwards.
    assert!(dir.path().join("error.log").exists());
}

#[test]
fn test_dry_run_reports_parse_errors() {
    let dir = TempDir::new().unwrap();
    let (engine, bootstrap, _) = test_engine(&dir, "listen = \"definitely not\"\n");

    let err = engine.init_cycle(&bootstrap).unwrap_err();
    assert!(matches!(err, gyre::CycleError::Parse(_)));
}

#[test]
fn test_dry_run_reports_missing_configuration_file() {
    let dir = TempDir::new().unwrap();
    let (engine, bootstrap, conf) = test_engine(&dir, "");
    std::fs::remove_file(&conf).unwrap();

    let err = engine.init_cycle(&bootstrap).unwrap_err();
    assert!(matches!(err, gyre::CycleError::Parse(_)));
}
