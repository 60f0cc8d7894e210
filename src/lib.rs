pub mod app;
pub mod bluetooth;
pub mod commands;
pub mod config;
pub mod connection;
pub mod device;
pub mod events;
pub mod repl;
pub mod serial;

pub use app::AppContext;
pub use config::LinkConfig;
pub use connection::{Connection, ConnectionState, Payload};
pub use device::{ConnectionMgr, DeviceError, TransportKind};
pub use events::{AppEvent, EventBus, EventKind};

use tracing_subscriber::EnvFilter;

/// Install the global logger. `RUST_LOG` overrides `default_level`.
/// Records from the `log` facade are captured as well.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialized");
    }
}
