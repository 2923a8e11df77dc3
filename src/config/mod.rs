pub mod settings;

// Re-export commonly used types
pub use settings::{
    default_config_path, load_settings, save_settings, CircuitSettings, NetworkSettings, RegionSettings,
    SchedulerSettings, TransportSettings,
};
