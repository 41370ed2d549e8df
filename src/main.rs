// src/main.rs

//! The main entry point for the gyre server binary.

use anyhow::Result;
use gyre::core::cycle::Cycle;
use gyre::core::engine::{Engine, EngineOptions, ProcessRole};
use gyre::core::module::ModuleRegistry;
use gyre::core::pidfile;
use gyre::server;
use std::env;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("gyre version {VERSION}");
        return Ok(());
    }

    // Configuration path, installation prefix, and test mode, in the
    // traditional short-flag form.
    let conf_file = flag_value(&args, "-c").unwrap_or("gyre.toml");
    let prefix = flag_value(&args, "-p").unwrap_or(".");
    let test_config = args.iter().any(|a| a == "-t");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .with_ansi(true)
        .init();

    let registry = ModuleRegistry::new();
    let options = EngineOptions {
        test_config,
        role: ProcessRole::Single,
        ..EngineOptions::default()
    };

    let bootstrap = Cycle::bootstrap(conf_file, prefix);
    let engine = Engine::new(registry, options, bootstrap.clone());

    if test_config {
        match engine.init_cycle(&bootstrap) {
            Ok(_) => {
                info!("configuration file {conf_file} test is successful");
                return Ok(());
            }
            Err(e) => {
                error!("configuration file {conf_file} test failed: {e}");
                std::process::exit(1);
            }
        }
    }

    let cycle = match engine.init_cycle(&bootstrap) {
        Ok(Some(cycle)) => cycle,
        Ok(None) => unreachable!("test-config outcome outside test mode"),
        Err(e) => {
            error!("could not build the initial configuration: {e}");
            std::process::exit(1);
        }
    };

    // The bootstrap pass skips the pid file because the serving pid is not
    // known until now.
    if let Err(e) = pidfile::create_pidfile(false, engine.options().inherited, &cycle, None) {
        error!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = server::run(engine.clone()).await {
        error!("server runtime error: {e:#}");
        return Err(e);
    }

    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}
