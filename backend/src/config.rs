use std::path::PathBuf;

pub const DEFAULT_MAX_AUDIO_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_STATIC_DIR: &str = "public";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Echo internal error detail in JSON bodies. Development only.
    pub expose_error_details: bool,
    pub max_audio_bytes: u64,
    /// Strategy names for `/api/download`, in priority order. `None` keeps the built-in order.
    pub strategy_order: Option<Vec<String>>,
    pub static_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            expose_error_details: false,
            max_audio_bytes: DEFAULT_MAX_AUDIO_BYTES,
            strategy_order: None,
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let development = std::env::var("APP_ENV")
            .ok()
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("development"));

        Self {
            bind_addr: resolve_bind_addr(),
            expose_error_details: read_bool_env("EXPOSE_ERROR_DETAILS").unwrap_or(development),
            max_audio_bytes: read_u64_env("MAX_AUDIO_BYTES")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_AUDIO_BYTES),
            strategy_order: std::env::var("RESOLVER_STRATEGIES")
                .ok()
                .map(|value| parse_name_list(&value))
                .filter(|names| !names.is_empty()),
            static_dir: std::env::var("STATIC_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR)),
        }
    }
}

fn read_bool_env(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn parse_name_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.to_ascii_lowercase())
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
