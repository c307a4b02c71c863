pub mod settings;

// Re-export commonly used types
pub use settings::{
    CircuitSettings, LoggingSettings, NetworkProfile, NetworkSettings, XferSettings,
    load_network_settings, SETTINGS_FILE,
};
