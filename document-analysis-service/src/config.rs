use std::path::PathBuf;

use analysis_bridge::BridgeConfig;

/// Service settings, read from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub bridge: BridgeConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .unwrap_or(3000);

        let upload_dir = std::env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("uploads"));

        Self {
            port,
            upload_dir,
            bridge: BridgeConfig::from_env(),
        }
    }
}
