pub mod settings;

use tracing::info;

pub use settings::AppSettings;

/// Initialize application configuration from the environment, logging the
/// outcome the way startup-critical configuration is logged elsewhere.
pub fn init_config() -> Result<AppSettings, Box<dyn std::error::Error>> {
    info!("Initializing application configuration from environment");
    let config = AppSettings::from_env()?;
    Ok(config)
}
