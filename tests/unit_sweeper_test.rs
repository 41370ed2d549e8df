use gyre::core::cycle::{Cycle, CycleState};
use gyre::core::engine::{Engine, EngineOptions};
use gyre::core::module::ModuleRegistry;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn setup(dir: &TempDir, options: EngineOptions) -> (Arc<Engine>, Arc<Cycle>) {
    let text = format!(
        "pid = {:?}\nerror_log = {:?}\n[[listen]]\naddr = \"127.0.0.1:{}\"\n",
        dir.path().join("gyre.pid"),
        dir.path().join("error.log"),
        free_port(),
    );
    let conf = dir.path().join("gyre.toml");
    std::fs::write(&conf, text).unwrap();

    let bootstrap = Cycle::bootstrap(conf, dir.path());
    let engine = Engine::new(ModuleRegistry::new(), options, bootstrap.clone());
    (engine, bootstrap)
}

#[tokio::test]
async fn test_live_cycle_survives_the_sweep_until_it_drains() {
    let dir = TempDir::new().unwrap();
    let (engine, bootstrap) = setup(&dir, EngineOptions::default());

    // Two retired generations: one still holding a connection, one idle.
    let c1 = engine.init_cycle(&bootstrap).unwrap().unwrap();
    let slot = c1.install_connections(4).acquire(5).unwrap();
    let c2 = engine.init_cycle(&c1).unwrap().unwrap();
    c2.install_connections(4);
    let c3 = engine.init_cycle(&c2).unwrap().unwrap();

    assert_eq!(c1.state(), CycleState::Retiring);
    assert_eq!(c2.state(), CycleState::Retiring);
    assert_eq!(c3.state(), CycleState::Committed);

    // First pass destroys only the idle one.
    assert_eq!(engine.sweep_retired(), 1);
    assert!(engine.has_retired_cycles());

    // Once the connection drains the next pass destroys the survivor and
    // tears the auxiliary state down with it.
    c1.connections().unwrap().release(slot);
    assert_eq!(engine.sweep_retired(), 1);
    assert!(!engine.has_retired_cycles());

    // Nothing left: a further sweep is a no-op.
    assert_eq!(engine.sweep_retired(), 0);
}

#[tokio::test]
async fn test_master_role_never_enqueues() {
    let dir = TempDir::new().unwrap();
    let (engine, bootstrap) = setup(
        &dir,
        EngineOptions {
            role: gyre::core::ProcessRole::Master,
            ..EngineOptions::default()
        },
    );

    let c1 = engine.init_cycle(&bootstrap).unwrap().unwrap();
    c1.install_connections(4);
    let _c2 = engine.init_cycle(&c1).unwrap().unwrap();

    assert!(!engine.has_retired_cycles());
}

#[tokio::test]
async fn test_timer_driven_sweep_fires_on_its_own() {
    let dir = TempDir::new().unwrap();
    let (engine, bootstrap) = setup(
        &dir,
        EngineOptions {
            sweep_interval: Duration::from_millis(50),
            ..EngineOptions::default()
        },
    );

    let c1 = engine.init_cycle(&bootstrap).unwrap().unwrap();
    c1.install_connections(4);
    let _c2 = engine.init_cycle(&c1).unwrap().unwrap();
    assert!(engine.has_retired_cycles());

    // Let the armed timer fire; the idle cycle must be gone without an
    // explicit sweep call.
    for _ in 0..100 {
        if !engine.has_retired_cycles() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!engine.has_retired_cycles());
}
