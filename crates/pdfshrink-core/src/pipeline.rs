//! Request pipeline
//!
//! Resolves a request's tier into passes and runs them one after another,
//! each reading the previous pass's file and writing its own inside a
//! per-request scratch directory. The directory is removed when the request
//! finishes, whether it succeeded or not.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info, info_span};

use crate::config::CompressionConfig;
use crate::error::CompressError;
use crate::final_pass::{run_final_pass, FinalPassMethod};
use crate::format_file_size;
use crate::reencode::{reencode_images, ReencodeStats};
use crate::structure::optimize_structure;
use crate::tier::{select_passes, AppliedTier, PassSpec, Tier};

/// A document plus how hard to compress it.
#[derive(Debug, Clone)]
pub struct CompressionRequest {
    data: Vec<u8>,
    tier: Tier,
    entitled: bool,
}

impl CompressionRequest {
    /// Fails with [`CompressError::InvalidTier`] for unknown tier names.
    pub fn new(data: Vec<u8>, tier: &str, entitled: bool) -> Result<Self, CompressError> {
        Ok(Self::with_tier(data, tier.parse()?, entitled))
    }

    pub fn with_tier(data: Vec<u8>, tier: Tier, entitled: bool) -> Self {
        Self {
            data,
            tier,
            entitled,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn entitled(&self) -> bool {
        self.entitled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub pass: &'static str,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Set for the final pass only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<FinalPassMethod>,
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub data: Vec<u8>,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Percentage saved, rounded to 2 decimals. Negative if the file grew.
    pub ratio: f64,
    pub tier_applied: AppliedTier,
    pub passes: Vec<PassReport>,
    pub images: ReencodeStats,
}

impl CompressionResult {
    pub fn used_fallback(&self) -> bool {
        self.passes
            .iter()
            .any(|p| p.method == Some(FinalPassMethod::Fallback))
    }

    pub fn report(&self) -> CompressionReport {
        CompressionReport {
            original_size: self.original_size,
            compressed_size: self.compressed_size,
            original_size_formatted: format_file_size(self.original_size),
            compressed_size_formatted: format_file_size(self.compressed_size),
            compression_ratio: self.ratio,
            tier_applied: self.tier_applied,
            used_fallback: self.used_fallback(),
            passes: self.passes.clone(),
            images: self.images,
        }
    }
}

/// Serializable summary of a [`CompressionResult`] without the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionReport {
    pub original_size: u64,
    pub compressed_size: u64,
    pub original_size_formatted: String,
    pub compressed_size_formatted: String,
    pub compression_ratio: f64,
    pub tier_applied: AppliedTier,
    pub used_fallback: bool,
    pub passes: Vec<PassReport>,
    pub images: ReencodeStats,
}

/// Percentage of `original` saved, rounded to 2 decimals.
pub fn compression_ratio(original: u64, compressed: u64) -> f64 {
    if original == 0 {
        return 0.0;
    }
    let saved = original as f64 - compressed as f64;
    (saved / original as f64 * 100.0 * 100.0).round() / 100.0
}

/// Run the full pipeline for one request.
pub fn compress(
    request: &CompressionRequest,
    config: &CompressionConfig,
) -> Result<CompressionResult, CompressError> {
    let plan = select_passes(request.tier, request.entitled);
    let span = info_span!(
        "compress",
        tier = %request.tier,
        applied = %plan.applied,
        bytes = request.data.len()
    );
    let _guard = span.enter();

    let scratch = scratch_dir(config)?;
    let mut current = scratch.path().join("input.pdf");
    fs::write(&current, &request.data)?;

    let mut passes = Vec::with_capacity(plan.passes.len());
    let mut images = ReencodeStats::default();

    for (index, pass) in plan.passes.iter().enumerate() {
        let next = scratch
            .path()
            .join(format!("pass{}-{}.pdf", index + 1, pass.name()));
        let bytes_in = fs::metadata(&current)?.len();

        let method = run_pass(pass, &current, &next, config, &mut images)?;

        let bytes_out = fs::metadata(&next)?.len();
        debug!("{}: {} -> {} bytes", pass.name(), bytes_in, bytes_out);
        passes.push(PassReport {
            pass: pass.name(),
            bytes_in,
            bytes_out,
            method,
        });
        current = next;
    }

    let data = fs::read(&current)?;
    let original_size = request.data.len() as u64;
    let compressed_size = data.len() as u64;
    let ratio = compression_ratio(original_size, compressed_size);

    info!(
        "Compressed {} -> {} bytes ({}% saved)",
        original_size, compressed_size, ratio
    );

    Ok(CompressionResult {
        data,
        original_size,
        compressed_size,
        ratio,
        tier_applied: plan.applied,
        passes,
        images,
    })
}

fn scratch_dir(config: &CompressionConfig) -> Result<TempDir, CompressError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("pdfshrink-");
    let dir = match &config.temp_dir {
        Some(parent) => builder.tempdir_in(parent)?,
        None => builder.tempdir()?,
    };
    Ok(dir)
}

fn run_pass(
    pass: &PassSpec,
    input: &Path,
    output: &Path,
    config: &CompressionConfig,
    images: &mut ReencodeStats,
) -> Result<Option<FinalPassMethod>, CompressError> {
    match pass {
        PassSpec::ReencodeImages(policy) => {
            let data = fs::read(input)?;
            let (reencoded, stats) = reencode_images(&data, policy, &config.tuning)?;
            images.merge(&stats);
            fs::write(output, reencoded)?;
            Ok(None)
        }
        PassSpec::Structural(options) => {
            let data = fs::read(input)?;
            let (optimized, _) = optimize_structure(&data, options)?;
            fs::write(output, optimized)?;
            Ok(None)
        }
        PassSpec::FinalPass(level) => run_final_pass(input, output, *level, config).map(Some),
        PassSpec::CopyThrough => {
            fs::copy(input, output)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::collect_candidates;
    use crate::testing::{create_test_pdf, gray_gradient, pdf_with_image, ImageSpec};
    use lopdf::Document;
    use pretty_assertions::assert_eq;

    /// Config whose final-pass tool never exists, so results do not depend
    /// on what is installed.
    fn offline_config() -> CompressionConfig {
        CompressionConfig {
            final_pass_tool: "pdfshrink-test-missing-tool".to_string(),
            ..Default::default()
        }
    }

    fn gray_image_pdf() -> Vec<u8> {
        pdf_with_image(&ImageSpec::gray(600, 600, gray_gradient(600, 600)), 144.0)
    }

    #[test]
    fn test_unknown_tier_rejected_before_work() {
        let err = CompressionRequest::new(b"%PDF-".to_vec(), "ultra", true).unwrap_err();
        assert!(matches!(err, CompressError::InvalidTier(_)));
    }

    #[test]
    fn test_high_without_entitlement_downsamples_to_gray() {
        let request = CompressionRequest::new(gray_image_pdf(), "high", false).unwrap();
        let result = compress(&request, &offline_config()).unwrap();

        assert_eq!(result.tier_applied, AppliedTier::HighBasic);
        assert_eq!(result.passes.len(), 3);
        assert!(result.used_fallback());

        let doc = Document::load_mem(&result.data).unwrap();
        let images = collect_candidates(&doc);
        assert_eq!(images.len(), 1);
        assert!(images[0].width <= 180);
        assert_eq!(images[0].color_mode, crate::ColorMode::Gray);
    }

    #[test]
    fn test_high_entitled_applies_premium_tier() {
        let request = CompressionRequest::new(gray_image_pdf(), "high", true).unwrap();
        let result = compress(&request, &offline_config()).unwrap();

        assert_eq!(result.tier_applied, AppliedTier::High);
        let names: Vec<_> = result.passes.iter().map(|p| p.pass).collect();
        assert_eq!(names, vec!["reencode_images", "structural"]);
        assert!(!result.used_fallback());
    }

    #[test]
    fn test_medium_is_near_idempotent() {
        let config = offline_config();
        let first = compress(
            &CompressionRequest::new(gray_image_pdf(), "medium", false).unwrap(),
            &config,
        )
        .unwrap();
        let second = compress(
            &CompressionRequest::new(first.data.clone(), "medium", false).unwrap(),
            &config,
        )
        .unwrap();

        let a = first.compressed_size as f64;
        let b = second.compressed_size as f64;
        assert!((a - b).abs() <= a * 0.05, "{} vs {}", a, b);
        assert_eq!(second.images.replaced, 0);
    }

    #[test]
    fn test_non_pdf_is_corrupt_for_every_tier() {
        for tier in Tier::ALL {
            for entitled in [true, false] {
                let request =
                    CompressionRequest::with_tier(b"hello, world".to_vec(), tier, entitled);
                let result = compress(&request, &offline_config());
                assert!(
                    matches!(result, Err(CompressError::CorruptInput(_))),
                    "tier {} entitled {}",
                    tier,
                    entitled
                );
            }
        }
    }

    #[test]
    fn test_lossless_without_tool_falls_back() {
        let request = CompressionRequest::new(create_test_pdf(3), "lossless", false).unwrap();
        let result = compress(&request, &offline_config()).unwrap();

        assert!(!result.data.is_empty());
        assert!(result.used_fallback());
        assert_eq!(result.passes[1].method, Some(FinalPassMethod::Fallback));
        let doc = Document::load_mem(&result.data).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn test_scratch_directory_is_removed() {
        let parent = tempfile::tempdir().unwrap();
        let config = CompressionConfig {
            temp_dir: Some(parent.path().to_path_buf()),
            ..offline_config()
        };

        let ok = CompressionRequest::new(create_test_pdf(1), "medium", false).unwrap();
        compress(&ok, &config).unwrap();
        let bad = CompressionRequest::new(b"junk".to_vec(), "medium", false).unwrap();
        assert!(compress(&bad, &config).is_err());

        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_report_fields() {
        let request = CompressionRequest::new(gray_image_pdf(), "medium", false).unwrap();
        let result = compress(&request, &offline_config()).unwrap();
        let report = result.report();

        assert_eq!(report.original_size, result.original_size);
        assert_eq!(report.tier_applied, AppliedTier::Medium);
        assert!(report.compression_ratio > 0.0);
        assert_eq!(report.images.replaced, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["tier_applied"], "medium");
        assert_eq!(json["passes"][1]["pass"], "copy_through");
        assert!(json["passes"][1].get("method").is_none());
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(0, 0), 0.0);
        assert_eq!(compression_ratio(1000, 250), 75.0);
        assert_eq!(compression_ratio(3, 2), 33.33);
        assert_eq!(compression_ratio(100, 150), -50.0);
    }
}
