//! API handlers for the compression server
//!
//! Provides REST endpoints for:
//! - Health and compression level listing
//! - JSON (base64) compression
//! - Multipart upload compression with PDF, ZIP or JSON stats responses

use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use pdfshrink_core::{
    compress, CompressError, CompressionReport, CompressionRequest, CompressionResult, Tier,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::ServiceConfig;
use crate::error::ServerError;
use crate::restrictions::{check_free_tier, UploadedFile};
use crate::AppState;

const DEFAULT_LEVEL: &str = "medium";

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Handler: GET /health
pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "pdfshrink-server",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct LevelInfo {
    pub name: &'static str,
    pub description: &'static str,
    /// Output differs for premium callers
    pub premium_variant: bool,
}

#[derive(Serialize)]
pub struct LevelListResponse {
    pub success: bool,
    pub levels: Vec<LevelInfo>,
    pub default: &'static str,
}

/// Handler: GET /api/compression-levels
pub async fn handle_compression_levels() -> Json<LevelListResponse> {
    let levels = Tier::ALL
        .iter()
        .map(|tier| LevelInfo {
            name: tier.as_str(),
            description: tier.description(),
            premium_variant: tier.has_premium_variant(),
        })
        .collect();

    Json(LevelListResponse {
        success: true,
        levels,
        default: DEFAULT_LEVEL,
    })
}

/// JSON compression request body
#[derive(Deserialize)]
pub struct CompressApiRequest {
    /// Base64-encoded PDF
    pub data: String,

    #[serde(default = "default_level")]
    pub compression_level: String,

    pub email: Option<String>,

    pub filename: Option<String>,
}

fn default_level() -> String {
    DEFAULT_LEVEL.to_string()
}

#[derive(Serialize)]
pub struct CompressApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Base64-encoded compressed PDF
    pub data: String,
    pub report: CompressionReport,
}

/// Handler: POST /api/compress
pub async fn handle_compress(
    State(state): State<AppState>,
    Json(req): Json<CompressApiRequest>,
) -> Result<Json<CompressApiResponse>, ServerError> {
    let tier: Tier = req.compression_level.parse()?;
    let data = STANDARD
        .decode(req.data.trim())
        .map_err(|e| ServerError::InvalidRequest(format!("data is not valid base64: {}", e)))?;

    let entitled = state.entitlements.is_entitled(req.email.as_deref());
    info!(
        "Compress request: level={}, bytes={}, entitled={}",
        tier,
        data.len(),
        entitled
    );

    let file = UploadedFile {
        name: req.filename.unwrap_or_else(|| "document.pdf".to_string()),
        data,
    };
    if !entitled {
        check_free_tier(std::slice::from_ref(&file), &state.config.limits)?;
    }

    let filename = output_name(&file.name);
    let result = run_pipeline(
        state.config.clone(),
        CompressionRequest::with_tier(file.data, tier, entitled),
    )
    .await?;

    Ok(Json(CompressApiResponse {
        success: true,
        filename: Some(filename),
        data: STANDARD.encode(&result.data),
        report: result.report(),
    }))
}

#[derive(Serialize)]
pub struct FileStats {
    pub filename: String,
    #[serde(flatten)]
    pub report: CompressionReport,
    pub data: String,
}

#[derive(Serialize)]
pub struct UploadStatsResponse {
    pub success: bool,
    pub files: Vec<FileStats>,
    pub file_count: usize,
    /// Seconds, 2 decimals
    pub processing_time: f64,
    pub compression_level: String,
    pub is_premium: bool,
}

/// Handler: POST /api/compress/upload
pub async fn handle_compress_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ServerError> {
    let started = Instant::now();

    let mut files = Vec::new();
    let mut level = DEFAULT_LEVEL.to_string();
    let mut email = None;
    let mut return_stats = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::InvalidRequest(format!("Failed to read upload: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        debug!("Received field: name='{}'", name);

        match name.as_str() {
            "file" | "files" => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("document{}.pdf", files.len() + 1));
                let data = field.bytes().await.map_err(|e| {
                    ServerError::InvalidRequest(format!("Failed to read file data: {}", e))
                })?;
                files.push(UploadedFile {
                    name: filename,
                    data: data.to_vec(),
                });
            }
            "compression_level" | "email" | "return_stats" => {
                let value = field.text().await.map_err(|e| {
                    ServerError::InvalidRequest(format!("Failed to read field {}: {}", name, e))
                })?;
                match name.as_str() {
                    "compression_level" => level = value,
                    "email" => email = Some(value),
                    _ => return_stats = parse_flag(&value),
                }
            }
            other => debug!("Ignoring field '{}'", other),
        }
    }

    if files.is_empty() {
        warn!("No file field found in multipart upload");
        return Err(ServerError::InvalidRequest(
            "No files provided. Use field name 'file' or 'files'".into(),
        ));
    }

    let tier: Tier = level.parse()?;
    let entitled = state.entitlements.is_entitled(email.as_deref());
    info!(
        "Upload: {} file(s), level={}, entitled={}",
        files.len(),
        tier,
        entitled
    );

    if !entitled {
        check_free_tier(&files, &state.config.limits)?;
    }

    let mut outputs: Vec<(String, CompressionResult)> = Vec::with_capacity(files.len());
    for file in files {
        let name = output_name(&file.name);
        let result = run_pipeline(
            state.config.clone(),
            CompressionRequest::with_tier(file.data, tier, entitled),
        )
        .await?;
        outputs.push((name, result));
    }

    if return_stats {
        let processing_time = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        let files: Vec<FileStats> = outputs
            .into_iter()
            .map(|(filename, result)| FileStats {
                filename,
                report: result.report(),
                data: STANDARD.encode(&result.data),
            })
            .collect();

        return Ok(Json(UploadStatsResponse {
            success: true,
            file_count: files.len(),
            files,
            processing_time,
            compression_level: tier.to_string(),
            is_premium: entitled,
        })
        .into_response());
    }

    if outputs.len() == 1 {
        let (_, result) = outputs.remove(0);
        return Ok(attachment("application/pdf", "compressed.pdf", result.data));
    }

    let archive = zip_outputs(&outputs)?;
    Ok(attachment("application/zip", "compressed_pdfs.zip", archive))
}

/// Run the blocking pipeline off the async executor.
async fn run_pipeline(
    config: Arc<ServiceConfig>,
    request: CompressionRequest,
) -> Result<CompressionResult, ServerError> {
    run_blocking(move || compress(&request, &config.compression)).await
}

/// A panic inside `task` becomes an internal error for this request only.
async fn run_blocking<T, F>(task: F) -> Result<T, ServerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CompressError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ServerError::Internal(format!("Compression task failed: {}", e)))?
        .map_err(ServerError::from)
}

/// `compressed_<basename>`
fn output_name(original: &str) -> String {
    let base = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("document.pdf");
    format!("compressed_{}", base)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn attachment(content_type: &'static str, filename: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

fn zip_outputs(outputs: &[(String, CompressionResult)]) -> Result<Vec<u8>, ServerError> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut used = HashSet::new();

    for (index, (name, result)) in outputs.iter().enumerate() {
        let entry = if used.insert(name.clone()) {
            name.clone()
        } else {
            format!("{}_{}", index + 1, name)
        };
        zip.start_file(entry, options)
            .map_err(|e| ServerError::Internal(format!("Failed to build archive: {}", e)))?;
        zip.write_all(&result.data)
            .map_err(|e| ServerError::Internal(format!("Failed to build archive: {}", e)))?;
    }

    let cursor = zip
        .finish()
        .map_err(|e| ServerError::Internal(format!("Failed to build archive: {}", e)))?;
    Ok(cursor.into_inner())
}
