//! Final pass: external linearizer with an in-process fallback
//!
//! The external tool (qpdf by default) is run on a file in the request's
//! scratch directory. When it is not installed the structural optimizer with
//! object streams runs instead. A tool that runs and fails is an error
//! unless [`CompressionConfig::fallback_on_tool_failure`] is set.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CompressionConfig;
use crate::error::CompressError;
use crate::structure::optimize_structure;
use crate::tier::{FinalPassLevel, StructuralOptions};

/// Which strategy produced the final-pass output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalPassMethod {
    ExternalTool,
    Fallback,
}

/// Exit statuses that count as success. qpdf uses 3 for "succeeded with
/// warnings".
const SUCCESS_CODES: [i32; 2] = [0, 3];

/// Command-line flags for a level, without the input and output paths.
pub fn qpdf_args(level: FinalPassLevel) -> Vec<&'static str> {
    match level {
        FinalPassLevel::Lossless => vec![
            "--linearize",
            "--compress-streams=y",
            "--decode-level=specialized",
            "--object-streams=generate",
        ],
        FinalPassLevel::High => vec![
            "--linearize",
            "--compress-streams=y",
            "--decode-level=all",
            "--object-streams=generate",
            "--compression-level=9",
            "--recompress-flate",
        ],
    }
}

/// Run the final pass from `input` to `output`.
pub fn run_final_pass(
    input: &Path,
    output: &Path,
    level: FinalPassLevel,
    config: &CompressionConfig,
) -> Result<FinalPassMethod, CompressError> {
    let external = find_executable(&config.final_pass_tool, config.tool_search_path.as_deref())
        .ok_or_else(|| CompressError::ExternalToolUnavailable(config.final_pass_tool.clone()))
        .and_then(|tool| run_external(&tool, level, input, output));

    match external {
        Ok(()) => Ok(FinalPassMethod::ExternalTool),
        Err(CompressError::ExternalToolUnavailable(tool)) => {
            warn!("{} not found, using in-process optimizer", tool);
            run_fallback(input, output)?;
            Ok(FinalPassMethod::Fallback)
        }
        Err(e @ CompressError::ExternalToolFailed { .. }) if config.fallback_on_tool_failure => {
            warn!("{}; using in-process optimizer", e);
            run_fallback(input, output)?;
            Ok(FinalPassMethod::Fallback)
        }
        Err(e) => Err(e),
    }
}

/// Invoke the tool as `tool <flags> <input> <output>`.
pub fn run_external(
    tool: &Path,
    level: FinalPassLevel,
    input: &Path,
    output: &Path,
) -> Result<(), CompressError> {
    let tool_name = tool.display().to_string();
    debug!("Running {} {:?}", tool_name, qpdf_args(level));

    let result = Command::new(tool)
        .args(qpdf_args(level))
        .arg(input)
        .arg(output)
        .output()
        .map_err(|e| CompressError::ExternalToolFailed {
            tool: tool_name.clone(),
            message: format!("failed to execute: {}", e),
        })?;

    let code = result.status.code();
    if !code.is_some_and(|c| SUCCESS_CODES.contains(&c)) {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(CompressError::ExternalToolFailed {
            tool: tool_name,
            message: format!(
                "exit code {}: {}",
                code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                stderr.trim()
            ),
        });
    }
    if code == Some(3) {
        debug!("{} finished with warnings", tool_name);
    }

    match fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => {
            info!("{} wrote {} bytes", tool_name, meta.len());
            Ok(())
        }
        _ => Err(CompressError::ExternalToolFailed {
            tool: tool_name,
            message: "no output file was produced".to_string(),
        }),
    }
}

/// Structural optimization with object streams, file to file.
fn run_fallback(input: &Path, output: &Path) -> Result<(), CompressError> {
    let data = fs::read(input)?;
    let (optimized, _) = optimize_structure(
        &data,
        &StructuralOptions {
            object_streams: true,
        },
    )?;
    fs::write(output, optimized)?;
    Ok(())
}

/// Locate an executable.
///
/// A name containing a path separator is checked as-is; a bare name is
/// looked up in `search_path` (`PATH` syntax) or, when that is `None`, the
/// process `PATH`.
pub fn find_executable(tool: &str, search_path: Option<&str>) -> Option<PathBuf> {
    if tool.is_empty() {
        return None;
    }

    let as_path = Path::new(tool);
    if as_path.components().count() > 1 {
        return is_executable(as_path).then(|| as_path.to_path_buf());
    }

    let dirs: OsString = match search_path {
        Some(path) => OsString::from(path),
        None => std::env::var_os("PATH")?,
    };

    std::env::split_paths(&dirs)
        .flat_map(|dir| candidate_names(tool).into_iter().map(move |n| dir.join(n)))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidate_names(tool: &str) -> Vec<String> {
    vec![tool.to_string(), format!("{}.exe", tool)]
}

#[cfg(not(windows))]
fn candidate_names(tool: &str) -> Vec<String> {
    vec![tool.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
