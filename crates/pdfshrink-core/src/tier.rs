//! Tier selection
//!
//! Maps a requested compression level and the caller's entitlement to the
//! ordered list of passes the pipeline runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CompressError;

/// Requested compression level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Lossless,
    Medium,
    High,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Lossless, Tier::Medium, Tier::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Lossless => "lossless",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Tier::Lossless => "Metadata cleanup and stream recompression, images untouched",
            Tier::Medium => "Images re-encoded at quality 90 and capped at 170 DPI",
            Tier::High => "Aggressive image downsampling; premium accounts keep colour",
        }
    }

    /// Whether the pass list depends on the entitlement flag.
    pub fn has_premium_variant(&self) -> bool {
        matches!(self, Tier::High)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lossless" => Ok(Tier::Lossless),
            "medium" => Ok(Tier::Medium),
            "high" => Ok(Tier::High),
            _ => Err(CompressError::InvalidTier(s.to_string())),
        }
    }
}

/// The tier that actually ran, after entitlement was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppliedTier {
    Lossless,
    Medium,
    High,
    HighBasic,
}

impl AppliedTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppliedTier::Lossless => "lossless",
            AppliedTier::Medium => "medium",
            AppliedTier::High => "high",
            AppliedTier::HighBasic => "high-basic",
        }
    }
}

impl fmt::Display for AppliedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target settings for an image re-encode pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImagePolicy {
    pub target_dpi: u32,
    pub quality: u8,
    pub grayscale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StructuralOptions {
    /// Pack objects into object streams and write a cross-reference stream.
    pub object_streams: bool,
}

/// Aggressiveness of the external final-pass tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalPassLevel {
    Lossless,
    High,
}

/// One step of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PassSpec {
    ReencodeImages(ImagePolicy),
    Structural(StructuralOptions),
    FinalPass(FinalPassLevel),
    CopyThrough,
}

impl PassSpec {
    pub fn name(&self) -> &'static str {
        match self {
            PassSpec::ReencodeImages(_) => "reencode_images",
            PassSpec::Structural(_) => "structural",
            PassSpec::FinalPass(_) => "final_pass",
            PassSpec::CopyThrough => "copy_through",
        }
    }
}

/// Resolved pipeline for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct PassPlan {
    pub applied: AppliedTier,
    pub passes: Vec<PassSpec>,
}

/// Build the pass list for a tier.
///
/// `high` without entitlement degrades to a quality 20 / 90 DPI grayscale
/// pipeline with an extra high-effort final pass.
pub fn select_passes(tier: Tier, entitled: bool) -> PassPlan {
    match (tier, entitled) {
        (Tier::Lossless, _) => PassPlan {
            applied: AppliedTier::Lossless,
            passes: vec![
                PassSpec::Structural(StructuralOptions {
                    object_streams: false,
                }),
                PassSpec::FinalPass(FinalPassLevel::Lossless),
            ],
        },
        (Tier::Medium, _) => PassPlan {
            applied: AppliedTier::Medium,
            passes: vec![
                PassSpec::ReencodeImages(ImagePolicy {
                    target_dpi: 170,
                    quality: 90,
                    grayscale: false,
                }),
                PassSpec::CopyThrough,
            ],
        },
        (Tier::High, true) => PassPlan {
            applied: AppliedTier::High,
            passes: vec![
                PassSpec::ReencodeImages(ImagePolicy {
                    target_dpi: 150,
                    quality: 70,
                    grayscale: false,
                }),
                PassSpec::Structural(StructuralOptions {
                    object_streams: true,
                }),
            ],
        },
        (Tier::High, false) => PassPlan {
            applied: AppliedTier::HighBasic,
            passes: vec![
                PassSpec::ReencodeImages(ImagePolicy {
                    target_dpi: 90,
                    quality: 20,
                    grayscale: true,
                }),
                PassSpec::Structural(StructuralOptions {
                    object_streams: true,
                }),
                PassSpec::FinalPass(FinalPassLevel::High),
            ],
        },
    }
}

/// Parse a tier string and resolve its passes in one step.
pub fn plan_for(tier: &str, entitled: bool) -> Result<PassPlan, CompressError> {
    Ok(select_passes(tier.parse()?, entitled))
}
