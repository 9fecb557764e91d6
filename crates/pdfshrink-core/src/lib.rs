//! PDF compression pipeline
//!
//! A request names a tier (`lossless`, `medium` or `high`) and whether the
//! caller is entitled to premium output. The tier selector turns that into
//! two or three passes:
//! - `reencode`: downsample and re-encode embedded images
//! - `structure`: metadata removal, object deduplication and pruning
//! - `final_pass`: external linearizer (qpdf) with an in-process fallback
//!
//! [`compress`] runs the passes and reports sizes, the tier that was applied
//! and per-pass statistics.

pub mod config;
pub mod error;
pub mod final_pass;
pub mod images;
pub mod pipeline;
pub mod reencode;
pub mod structure;
pub mod tier;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CompressionConfig, ReencodeTuning};
pub use error::CompressError;
pub use final_pass::{find_executable, qpdf_args, run_final_pass, FinalPassMethod};
pub use images::{collect_candidates, ColorMode, ImageCandidate};
pub use pipeline::{
    compress, compression_ratio, CompressionReport, CompressionRequest, CompressionResult,
    PassReport,
};
pub use reencode::{reencode_images, ReencodeStats};
pub use structure::{optimize_structure, StructuralStats};
pub use tier::{
    plan_for, select_passes, AppliedTier, FinalPassLevel, ImagePolicy, PassPlan, PassSpec,
    StructuralOptions, Tier,
};

/// Parse PDF bytes and return page count
pub fn get_page_count(bytes: &[u8]) -> Result<u32, CompressError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| CompressError::CorruptInput(e.to_string()))?;
    Ok(doc.get_pages().len() as u32)
}

/// Human-readable size: bytes below 1 KB, otherwise two decimals.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_test_pdf;
    use proptest::prelude::*;

    #[test]
    fn test_get_page_count() {
        assert_eq!(get_page_count(&create_test_pdf(3)).unwrap(), 3);
    }

    #[test]
    fn test_get_page_count_invalid() {
        let result = get_page_count(b"not a pdf");
        assert!(matches!(result, Err(CompressError::CorruptInput(_))));
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(1023), "1023 B");
        assert_eq!(format_file_size(1024), "1.00 KB");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_file_size(4096 * 1024 * 1024 * 1024), "4096.00 GB");
    }

    proptest! {
        #[test]
        fn format_file_size_has_unit_and_two_decimals(bytes in 1024u64..u64::MAX / 2) {
            let formatted = format_file_size(bytes);
            let (number, unit) = formatted.split_once(' ').unwrap();
            prop_assert!(["KB", "MB", "GB"].contains(&unit));
            prop_assert_eq!(number.split_once('.').map(|(_, d)| d.len()), Some(2));
            prop_assert!(number.parse::<f64>().unwrap() >= 1.0);
        }
    }
}
