//! Service configuration
//!
//! Loaded from an optional TOML file. Every section and field has a
//! default, so an empty file (or no file) is a valid configuration.

use std::fs;
use std::path::Path;

use anyhow::Context;
use pdfshrink_core::CompressionConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Pipeline settings, including `[compression.tuning]`
    pub compression: CompressionConfig,
    pub limits: Limits,
    pub entitlements: EntitlementConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }
}

/// Upload limits. The `free_*` limits apply to callers without entitlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub free_max_files: usize,
    pub free_max_file_mb: u64,
    pub free_max_pages: u32,
    /// Request body limit for everyone
    pub max_upload_mb: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            free_max_files: 2,
            free_max_file_mb: 5,
            free_max_pages: 10,
            max_upload_mb: 50,
        }
    }
}

impl Limits {
    pub fn free_max_file_bytes(&self) -> u64 {
        self.free_max_file_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// Addresses with premium output, matched case-insensitively
    pub premium_emails: Vec<String>,
    /// Entitlement for unknown or missing addresses
    pub default_entitled: bool,
}
