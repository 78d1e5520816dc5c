use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::crd::KELDA_VERSION;

/// Minion configuration, loaded from `minion.toml` plus `KELDA_`-prefixed
/// environment overrides (e.g. `KELDA_SERVER__PORT=9001`).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub platform: PlatformSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub license: Option<LicenseSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformSettings {
    /// Namespace the minion itself runs in; the canonical `regcred` secret
    /// lives here.
    #[serde(default = "default_platform_namespace")]
    pub namespace: String,

    /// Image carrying the minion binary, used as the dev-mode init
    /// container.
    #[serde(default = "default_minion_image")]
    pub minion_image: String,

    /// Path of the minion binary inside `minion_image`.
    #[serde(default = "default_minion_binary_path")]
    pub minion_binary_path: String,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            namespace: default_platform_namespace(),
            minion_image: default_minion_image(),
            minion_binary_path: default_minion_binary_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerSettings {
    /// Failures per work item before it is dropped until the next event.
    #[serde(default = "default_requeue_budget")]
    pub requeue_budget: u32,

    /// Advisory status worker count. The controller runtime already
    /// serializes per key and parallelizes across keys; this knob is kept
    /// for operators tuning against cluster size.
    #[serde(default = "default_status_workers")]
    pub status_workers: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            requeue_budget: default_requeue_budget(),
            status_workers: default_status_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LicenseSettings {
    pub customer: String,
    /// "CUSTOMER" or "TRIAL".
    pub license_type: String,
    pub seats: usize,
    /// RFC 3339 timestamp.
    pub expiry_time: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_platform_namespace() -> String {
    "kelda".to_string()
}

fn default_minion_image() -> String {
    format!("keldaio/kelda-minion:{KELDA_VERSION}")
}

fn default_minion_binary_path() -> String {
    "/usr/local/bin/kelda-minion".to_string()
}

fn default_requeue_budget() -> u32 {
    3
}

fn default_status_workers() -> usize {
    8
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("minion").required(false))
            .add_source(Environment::with_prefix("KELDA").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_knob() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.platform.namespace, "kelda");
        assert_eq!(settings.controller.requeue_budget, 3);
        assert_eq!(settings.controller.status_workers, 8);
        assert!(settings.license.is_none());
    }

    #[test]
    fn sections_deserialize_with_partial_input() {
        let settings: Settings =
            serde_json::from_value(serde_json::json!({ "server": { "port": 9001 } })).unwrap();
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.server.host, "0.0.0.0");
    }
}
