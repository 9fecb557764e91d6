//! Free-tier upload restrictions

use pdfshrink_core::get_page_count;
use tracing::debug;

use crate::config::Limits;
use crate::error::ServerError;

/// One uploaded document.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Check file count, size and page count against the free-tier limits.
///
/// A file that cannot be parsed is reported as corrupt input rather than a
/// restriction.
pub fn check_free_tier(files: &[UploadedFile], limits: &Limits) -> Result<(), ServerError> {
    if files.len() > limits.free_max_files {
        return Err(ServerError::Restricted(format!(
            "Free users can only upload up to {} files at once.",
            limits.free_max_files
        )));
    }

    for file in files {
        if file.data.len() as u64 > limits.free_max_file_bytes() {
            return Err(ServerError::Restricted(format!(
                "File {} exceeds {}MB free limit.",
                file.name, limits.free_max_file_mb
            )));
        }

        let pages = get_page_count(&file.data).map_err(|e| {
            ServerError::CorruptInput(format!("Could not read {}: {}", file.name, e))
        })?;
        debug!("{}: {} pages", file.name, pages);
        if pages > limits.free_max_pages {
            return Err(ServerError::Restricted(format!(
                "File {} exceeds {}-page free limit.",
                file.name, limits.free_max_pages
            )));
        }
    }

    Ok(())
}
