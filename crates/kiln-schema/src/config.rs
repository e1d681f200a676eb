use crate::vendor::Vendor;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Optional `config.toml`. Every field has a built-in default, so an absent
/// file behaves like an empty one.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KilnConfig {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub storage: Option<PathBuf>,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    /// `dpkg-buildpackage -J<n>`; 0 means `-Jauto`. Unset or 1 builds serially.
    #[serde(default)]
    pub parallel: Option<u32>,
    /// Mirror per archive name, with `default` as the fallback entry.
    #[serde(default)]
    pub mirrors: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub vendors: BTreeMap<String, VendorSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsSection {
    #[serde(default = "default_boot_secs")]
    pub boot_secs: u64,
    #[serde(default = "default_execute_secs")]
    pub execute_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            boot_secs: default_boot_secs(),
            execute_secs: default_execute_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

fn default_boot_secs() -> u64 {
    300
}

fn default_execute_secs() -> u64 {
    4 * 60 * 60
}

fn default_stop_grace_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VendorSection {
    #[serde(default)]
    pub default_suite: Option<String>,
    #[serde(default)]
    pub components: Option<Vec<String>>,
    #[serde(default)]
    pub apt_key: Option<String>,
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl KilnConfig {
    /// The named vendor with any `[vendors.<name>]` overrides applied.
    pub fn vendor(&self, name: &str) -> Vendor {
        let vendor = Vendor::builtin(name);
        match self.vendors.get(name) {
            Some(section) => vendor.with_overrides(section),
            None => vendor,
        }
    }
}

pub fn parse_config_str(content: &str) -> Result<KilnConfig, SchemaError> {
    Ok(toml::from_str(content)?)
}

pub fn parse_config_file(path: &Path) -> Result<KilnConfig, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Load configuration: an explicit path must exist; otherwise `KILN_CONFIG`
/// (which must exist when set), then the default location if present, then
/// built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<KilnConfig, SchemaError> {
    if let Some(path) = explicit {
        return load_required(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return load_required(Path::new(&path));
    }
    match default_config_path() {
        Some(path) if path.is_file() => parse_config_file(&path),
        _ => Ok(KilnConfig::default()),
    }
}

fn load_required(path: &Path) -> Result<KilnConfig, SchemaError> {
    if !path.is_file() {
        return Err(SchemaError::ConfigNotFound(path.display().to_string()));
    }
    parse_config_file(path)
}

/// `$XDG_CONFIG_HOME/kiln/config.toml`, else `~/.config/kiln/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", ".config").map(|d| d.join("kiln").join("config.toml"))
}

/// `$XDG_CACHE_HOME/kiln`, else `~/.cache/kiln`, else `./kiln-storage`.
pub fn default_storage_root() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache")
        .map_or_else(|| PathBuf::from("kiln-storage"), |d| d.join("kiln"))
}

fn xdg_dir(var: &str, home_fallback: &str) -> Option<PathBuf> {
    match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => std::env::var_os("HOME").map(|home| PathBuf::from(home).join(home_fallback)),
    }
}

/// The host's Debian architecture name.
///
/// Asks `dpkg --print-architecture` and falls back to mapping the Rust
/// target architecture when dpkg is unavailable.
pub fn host_architecture() -> String {
    if let Ok(output) = std::process::Command::new("dpkg")
        .arg("--print-architecture")
        .output()
    {
        if output.status.success() {
            let arch = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            if !arch.is_empty() {
                return arch;
            }
        }
    }
    debian_arch_for(std::env::consts::ARCH).to_owned()
}

fn debian_arch_for(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        "mips64" => "mips64el",
        other => other,
    }
}
