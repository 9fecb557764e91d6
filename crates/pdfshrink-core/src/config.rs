//! Pipeline configuration
//!
//! Everything the pipeline would otherwise look up from the process
//! environment is carried here and passed into [`crate::compress`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for one compression pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Name or path of the external final-pass tool (default: `qpdf`)
    pub final_pass_tool: String,
    /// Directories searched for the tool, in `PATH` syntax. `None` uses the
    /// `PATH` of the running process.
    pub tool_search_path: Option<String>,
    /// Also fall back to the in-process optimizer when the tool runs but fails
    pub fallback_on_tool_failure: bool,
    /// Parent directory for per-request scratch files (default: system temp)
    pub temp_dir: Option<PathBuf>,
    pub tuning: ReencodeTuning,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            final_pass_tool: "qpdf".to_string(),
            tool_search_path: None,
            fallback_on_tool_failure: false,
            temp_dir: None,
            tuning: ReencodeTuning::default(),
        }
    }
}

/// Image re-encoding heuristics.
///
/// Defaults are the constants the service has always shipped with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReencodeTuning {
    /// Minimum payload size when quality < 50
    pub min_bytes_low_quality: usize,
    /// Minimum payload size when quality < 80
    pub min_bytes_mid_quality: usize,
    /// Minimum payload size otherwise
    pub min_bytes_high_quality: usize,

    /// Passes at or below this quality run in high-compression mode
    pub high_compression_quality: u8,

    /// Acceptance factor when quality > 90
    pub accept_factor_very_high: f64,
    /// Acceptance factor when quality > 80
    pub accept_factor_high: f64,
    /// Acceptance factor for every other quality
    pub accept_factor_default: f64,
    /// Acceptance factor in high-compression mode
    pub accept_factor_high_compression: f64,

    /// Grayscale JPEG boost when quality > 85, and its cap
    pub gray_boost_high: u8,
    pub gray_boost_high_cap: u8,
    /// Grayscale JPEG boost otherwise, and its cap
    pub gray_boost_low: u8,
    pub gray_boost_low_cap: u8,

    /// Colour images larger than this on both axes go gray in high-compression mode
    pub grayscale_min_dimension: u32,

    /// Lossless output is considered above this quality
    pub lossless_min_quality: u8,
    /// Maximum distinct colours for palette output
    pub palette_max_colors: usize,

    /// Unsharp mask is applied below this effective quality
    pub sharpen_below_quality: u8,
    pub sharpen_sigma: f32,
    pub sharpen_threshold: i32,
}

impl Default for ReencodeTuning {
    fn default() -> Self {
        Self {
            min_bytes_low_quality: 5_000,
            min_bytes_mid_quality: 10_000,
            min_bytes_high_quality: 20_000,
            high_compression_quality: 30,
            accept_factor_very_high: 0.95,
            accept_factor_high: 0.98,
            accept_factor_default: 1.1,
            accept_factor_high_compression: 1.2,
            gray_boost_high: 5,
            gray_boost_high_cap: 98,
            gray_boost_low: 10,
            gray_boost_low_cap: 95,
            grayscale_min_dimension: 300,
            lossless_min_quality: 85,
            palette_max_colors: 256,
            sharpen_below_quality: 60,
            sharpen_sigma: 0.5,
            sharpen_threshold: 2,
        }
    }
}

impl ReencodeTuning {
    pub fn is_high_compression(&self, quality: u8) -> bool {
        quality <= self.high_compression_quality
    }

    /// Payloads smaller than this are not worth decoding.
    pub fn min_payload_bytes(&self, quality: u8) -> usize {
        if quality < 50 {
            self.min_bytes_low_quality
        } else if quality < 80 {
            self.min_bytes_mid_quality
        } else {
            self.min_bytes_high_quality
        }
    }

    /// A replacement must be smaller than `original * factor`.
    pub fn acceptance_factor(&self, quality: u8) -> f64 {
        if self.is_high_compression(quality) {
            self.accept_factor_high_compression
        } else if quality > 90 {
            self.accept_factor_very_high
        } else if quality > 80 {
            self.accept_factor_high
        } else {
            self.accept_factor_default
        }
    }

    /// JPEG quality used for grayscale output.
    pub fn grayscale_quality(&self, quality: u8) -> u8 {
        if self.is_high_compression(quality) {
            quality
        } else if quality > 85 {
            quality
                .saturating_add(self.gray_boost_high)
                .min(self.gray_boost_high_cap)
        } else {
            quality
                .saturating_add(self.gray_boost_low)
                .min(self.gray_boost_low_cap)
        }
    }
}
