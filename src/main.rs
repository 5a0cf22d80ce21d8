use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::{env, thread};

use validator_server::{mock, DeviceEntry, Protocol, Result, Server, ServerConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let stop_polling = Arc::new(AtomicBool::new(false));

    // Set signal handlers
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop_polling))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop_polling))?;

    let config = load_config()?;

    // no wire transport is linked in, every configured port gets a scripted device
    let mut server = Server::new(&config, |entry| Ok(mock::demo(entry.protocol)))?;

    let mut rx = server.add_rx()?;
    let stop_events = Arc::clone(&stop_polling);

    thread::spawn(move || {
        while !stop_events.load(Ordering::Relaxed) {
            if let Ok(event) = rx.recv_timeout(std::time::Duration::from_millis(250)) {
                log::info!("Received event from {event}");
            }
        }
    });

    server.serve(stop_polling.as_ref())
}

fn load_config() -> Result<ServerConfig> {
    if let Ok(path) = env::var("VALIDATOR_CONFIG") {
        return ServerConfig::from_file(path);
    }

    let port = env::var("VALIDATOR_PORT").unwrap_or("/dev/ttyS3".into());
    let protocol = env::var("VALIDATOR_PROTOCOL")
        .map(|p| p.parse::<Protocol>())
        .unwrap_or(Ok(Protocol::Jcm))?;

    Ok(ServerConfig {
        devices: vec![DeviceEntry {
            port,
            protocol,
            configuration: Default::default(),
        }],
        poll: Default::default(),
    })
}
