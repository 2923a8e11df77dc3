// sim-circuits: simulator-side LLUDP circuits

pub mod config;
pub mod networking;
pub mod utils;

pub use config::{load_settings, TransportSettings};
pub use networking::{CircuitManager, NetworkError, NetworkResult};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
