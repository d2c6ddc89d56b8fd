use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::chunker::Page;
use crate::config::UploadConfig;
use crate::error::{AppError, Result};

/// Parsed document content
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// File name of the upload; doubles as the `source` metadata of its chunks.
    pub source_id: String,
    pub file_type: String,
    pub pages: Vec<Page>,
}

impl LoadedDocument {
    pub fn total_chars(&self) -> usize {
        self.pages.iter().map(|p| p.text.chars().count()).sum()
    }
}

/// Name a document is indexed under: the bare file name.
pub fn source_id_for(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Check type and size limits before anything is read.
pub fn validate(path: &Path, limits: &UploadConfig) -> Result<String> {
    let source_id = source_id_for(path);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    if !limits
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    {
        return Err(AppError::ingestion(
            source_id,
            format!("Unsupported file type: .{}", ext),
        ));
    }

    let meta = fs::metadata(path).map_err(|e| AppError::ingestion(&source_id, e.to_string()))?;
    if !meta.is_file() {
        return Err(AppError::ingestion(source_id, "not a regular file"));
    }
    if meta.len() > limits.max_file_bytes {
        return Err(AppError::ingestion(
            source_id,
            format!(
                "file is {} bytes, limit is {} bytes",
                meta.len(),
                limits.max_file_bytes
            ),
        ));
    }
    Ok(ext)
}

/// Validate and parse a document file into pages of plain text
pub fn load_file(path: &Path, limits: &UploadConfig) -> Result<LoadedDocument> {
    let ext = validate(path, limits)?;
    let source_id = source_id_for(path);

    let (file_type, pages) = match ext.as_str() {
        "pdf" => {
            let bytes = fs::read(path).map_err(|e| AppError::ingestion(&source_id, e.to_string()))?;
            ("pdf", parse_pdf(&source_id, &bytes)?)
        }
        "md" | "markdown" => ("md", vec![Page::new(read_utf8(&source_id, path)?, None)]),
        _ => ("txt", vec![Page::new(read_utf8(&source_id, path)?, None)]),
    };

    let doc = LoadedDocument {
        source_id,
        file_type: file_type.to_string(),
        pages,
    };
    if doc.pages.iter().all(|p| p.text.trim().is_empty()) {
        return Err(AppError::ingestion(
            doc.source_id,
            "Document is empty or could not be parsed",
        ));
    }
    Ok(doc)
}

fn read_utf8(source_id: &str, path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| AppError::ingestion(source_id, e.to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| AppError::ingestion(source_id, "unsupported encoding: file is not UTF-8"))
}

/// Extract text page by page; page numbers are 1-based.
fn parse_pdf(source_id: &str, bytes: &[u8]) -> Result<Vec<Page>> {
    // pdf-extract panics on some malformed inputs
    let extracted = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }))
    .map_err(|_| AppError::ingestion(source_id, "PDF parse error: malformed document"))?
    .map_err(|e| AppError::ingestion(source_id, format!("PDF parse error: {}", e)))?;

    Ok(extracted
        .into_iter()
        .enumerate()
        .map(|(i, text)| Page::new(text, Some(i as u32 + 1)))
        .collect())
}
