use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub activation_verify_url: String,
    pub data_dir: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            activation_verify_url: env::var("ACTIVATION_VERIFY_URL")
                .unwrap_or_else(|_| {
                    warn!("ACTIVATION_VERIFY_URL not set, using empty value");
                    String::new()
                }),
            data_dir: env::var("DATA_DIR")
                .unwrap_or_else(|_| {
                    warn!("DATA_DIR not set, using default");
                    "./data".to_string()
                }),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.activation_verify_url.is_empty()
    }
}
