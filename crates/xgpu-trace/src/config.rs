use std::fmt;

use crate::tables::DEFAULT_COPY_CHUNK_SIZE;

pub const DEFAULT_STAGING_SUFFIX: &str = ".mem";

/// The guest has 512 MiB of physical memory; no single access can legitimately exceed it.
pub const DEFAULT_MAX_REGION_SIZE: u32 = 512 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceWriterConfig {
    /// Appended to the output path to name the staging blob file.
    pub staging_suffix: String,
    /// Buffer size used when streaming the staging blob into the final trace.
    pub copy_chunk_size: usize,
    /// Confirm checksum hits by comparing against the staged bytes before reusing a memory
    /// block. Costs a staging read per hit.
    pub verify_on_hash_hit: bool,
    /// Largest memory access captured. Bigger accesses fail with `OutOfMemory` before any
    /// buffer is allocated.
    pub max_region_size: u32,
}

impl Default for TraceWriterConfig {
    fn default() -> Self {
        Self {
            staging_suffix: DEFAULT_STAGING_SUFFIX.to_string(),
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
            verify_on_hash_hit: false,
            max_region_size: DEFAULT_MAX_REGION_SIZE,
        }
    }
}

impl TraceWriterConfig {
    /// Reads overrides from `XGPU_TRACE_STAGING_SUFFIX`, `XGPU_TRACE_COPY_CHUNK`,
    /// `XGPU_TRACE_VERIFY` and `XGPU_TRACE_MAX_REGION`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(suffix) = lookup("XGPU_TRACE_STAGING_SUFFIX") {
            if suffix.is_empty() {
                return Err(ConfigError::InvalidEnv("XGPU_TRACE_STAGING_SUFFIX"));
            }
            config.staging_suffix = suffix;
        }

        if let Some(raw) = lookup("XGPU_TRACE_COPY_CHUNK") {
            config.copy_chunk_size = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or(ConfigError::InvalidEnv("XGPU_TRACE_COPY_CHUNK"))?;
        }

        if let Some(raw) = lookup("XGPU_TRACE_VERIFY") {
            config.verify_on_hash_hit = match raw.trim() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => return Err(ConfigError::InvalidEnv("XGPU_TRACE_VERIFY")),
            };
        }

        if let Some(raw) = lookup("XGPU_TRACE_MAX_REGION") {
            config.max_region_size = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or(ConfigError::InvalidEnv("XGPU_TRACE_MAX_REGION"))?;
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidEnv(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnv(var) => write!(f, "invalid value for env var {var}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = TraceWriterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, TraceWriterConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = TraceWriterConfig::from_lookup(lookup(&[
            ("XGPU_TRACE_STAGING_SUFFIX", ".blob"),
            ("XGPU_TRACE_COPY_CHUNK", "4096"),
            ("XGPU_TRACE_VERIFY", "true"),
            ("XGPU_TRACE_MAX_REGION", "65536"),
        ]))
        .unwrap();
        assert_eq!(config.max_region_size, 65536);
        assert_eq!(config.staging_suffix, ".blob");
        assert_eq!(config.copy_chunk_size, 4096);
        assert!(config.verify_on_hash_hit);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = TraceWriterConfig::from_lookup(lookup(&[("XGPU_TRACE_COPY_CHUNK", "0")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidEnv("XGPU_TRACE_COPY_CHUNK"));

        let err = TraceWriterConfig::from_lookup(lookup(&[("XGPU_TRACE_VERIFY", "maybe")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidEnv("XGPU_TRACE_VERIFY"));
    }
}
