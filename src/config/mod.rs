pub mod settings;

pub use settings::{DeviceSettings, Settings, SettingsStore, StaticLocationConfig};
