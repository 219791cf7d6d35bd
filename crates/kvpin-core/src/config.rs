use serde::{Deserialize, Serialize};

use crate::error::KvpinError;

/// Top-level kvpin configuration, loaded from kvpin.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvpinConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Environment variable holding the visible-device list
    #[serde(default = "default_visible_devices_env")]
    pub visible_devices_env: String,
    /// Per-core on-chip scratch size in bytes
    #[serde(default = "default_scratch_bytes")]
    pub scratch_bytes: u64,
    /// Vector core count used when the driver cannot report it
    #[serde(default = "default_vector_cores")]
    pub vector_cores: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Lowest driver major version that supports direct host registration
    #[serde(default = "default_direct_registration_min_major")]
    pub direct_registration_min_major: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on cores used by a single-layer transfer
    #[serde(default = "default_max_width")]
    pub single_layer_max_width: u32,
    /// Upper bound on cores used by a bounded multi-layer transfer
    #[serde(default = "default_max_width")]
    pub bounded_multi_layer_max_width: u32,
}

/// Library names tried, in order, when loading the vendor driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_runtime_libs")]
    pub runtime_libs: Vec<String>,
    #[serde(default = "default_hal_libs")]
    pub hal_libs: Vec<String>,
    #[serde(default = "default_management_libs")]
    pub management_libs: Vec<String>,
    #[serde(default = "default_dcmi_libs")]
    pub dcmi_libs: Vec<String>,
    #[serde(default = "default_kernel_libs")]
    pub kernel_libs: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            visible_devices_env: default_visible_devices_env(),
            scratch_bytes: default_scratch_bytes(),
            vector_cores: default_vector_cores(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            direct_registration_min_major: default_direct_registration_min_major(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            single_layer_max_width: default_max_width(),
            bounded_multi_layer_max_width: default_max_width(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            runtime_libs: default_runtime_libs(),
            hal_libs: default_hal_libs(),
            management_libs: default_management_libs(),
            dcmi_libs: default_dcmi_libs(),
            kernel_libs: default_kernel_libs(),
        }
    }
}

impl KvpinConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, KvpinError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KvpinError::Config(format!("{}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, KvpinError> {
        let config: KvpinConfig =
            toml::from_str(content).map_err(|e| KvpinError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }

    fn validate(&self) -> Result<(), KvpinError> {
        if self.dispatch.single_layer_max_width == 0
            || self.dispatch.bounded_multi_layer_max_width == 0
        {
            return Err(KvpinError::Config(
                "dispatch widths must be at least 1".to_string(),
            ));
        }
        if self.device.visible_devices_env.is_empty() {
            return Err(KvpinError::Config(
                "device.visible_devices_env must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/kvpin/kvpin.toml`
/// 2. Local fallback: `./kvpin.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/kvpin/kvpin.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "kvpin.toml".to_string()
}

fn default_visible_devices_env() -> String {
    "ASCEND_RT_VISIBLE_DEVICES".to_string()
}

fn default_scratch_bytes() -> u64 {
    192 * 1024
}

fn default_vector_cores() -> u32 {
    48
}

fn default_direct_registration_min_major() -> i64 {
    25
}

fn default_max_width() -> u32 {
    4
}

fn default_runtime_libs() -> Vec<String> {
    vec!["libascendcl.so".to_string()]
}

fn default_hal_libs() -> Vec<String> {
    vec!["libascend_hal.so".to_string()]
}

fn default_management_libs() -> Vec<String> {
    vec!["libdrvdsmi_host.so".to_string()]
}

fn default_dcmi_libs() -> Vec<String> {
    vec!["libdcmi.so".to_string()]
}

fn default_kernel_libs() -> Vec<String> {
    vec!["libkvpin_kernels.so".to_string()]
}
