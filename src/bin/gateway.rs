use std::sync::atomic::Ordering;

use log::info;

use starlane::config::{self, Config};
use starlane::gateway::Gateway;

fn main() -> std::io::Result<()> {
    env_logger::init();
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Note: set RUST_LOG=info to see logs");
    }

    let config = Config::from_env();
    let shutdown = config::shutdown_flag();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed))
            .expect("install SIGINT handler");
    }

    let mut gateway = Gateway::bind(config.gateway_listen, shutdown)?;
    info!("gateway up, press Ctrl+C to stop");
    gateway.run();
    Ok(())
}
