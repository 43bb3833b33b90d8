//! Format adapter registry and extraction routing.
//!
//! Each supported format implements [`DocumentAdapter`]. The router sniffs
//! the first bytes of a file once, probes adapters in a fixed order (PDF,
//! EPUB, FB2, TXT), and the first adapter whose `supports` check passes
//! performs the extraction. The adapter set is closed; there is no runtime
//! registration.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::adapter_epub::EpubAdapter;
use crate::adapter_fb2::Fb2Adapter;
use crate::adapter_pdf::PdfAdapter;
use crate::adapter_txt::TxtAdapter;
use crate::models::ExtractedDocument;

/// How many leading bytes the router hands to `supports` probes.
pub const SNIFF_BYTES: usize = 4096;

static STEM_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[._-]+").unwrap());

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported format: {path}")]
    UnsupportedFormat { path: String },
    #[error("{format} extraction failed for {path}: {detail}")]
    Parse {
        format: &'static str,
        path: String,
        detail: String,
    },
}

impl ExtractionError {
    pub fn parse(format: &'static str, path: &Path, detail: impl Into<String>) -> Self {
        ExtractionError::Parse {
            format,
            path: path_string(path),
            detail: detail.into(),
        }
    }
}

/// One document format. Adapters are stateless unit structs probed through
/// the registry below.
pub trait DocumentAdapter: Send + Sync {
    /// Format tag stored in book metadata ("pdf", "epub", "fb2", "txt").
    fn format(&self) -> &'static str;

    /// Cheap probe over the path and the sniffed file prefix.
    fn supports(&self, path: &Path, sniff: &[u8]) -> bool;

    /// Full extraction over the raw file bytes.
    fn extract(&self, path: &Path, raw: &[u8]) -> Result<ExtractedDocument, ExtractionError>;
}

/// Probe order matters: TXT is the permissive fallback and goes last.
pub fn adapters() -> &'static [&'static dyn DocumentAdapter] {
    static ADAPTERS: &[&dyn DocumentAdapter] = &[&PdfAdapter, &EpubAdapter, &Fb2Adapter, &TxtAdapter];
    ADAPTERS
}

/// First adapter claiming the file, if any.
pub fn adapter_for(path: &Path, sniff: &[u8]) -> Option<&'static dyn DocumentAdapter> {
    adapters().iter().copied().find(|a| a.supports(path, sniff))
}

/// Read a file, route it to an adapter, and extract it. Returns the raw
/// bytes alongside the document so callers can fingerprint without a
/// second read.
pub fn extract_document(path: &Path) -> Result<(Vec<u8>, ExtractedDocument), ExtractionError> {
    let raw = fs::read(path).map_err(|e| ExtractionError::Io {
        path: path_string(path),
        source: e,
    })?;
    let document = extract_from_bytes(path, &raw)?;
    Ok((raw, document))
}

/// Route already-read bytes to an adapter and extract them.
pub fn extract_from_bytes(path: &Path, raw: &[u8]) -> Result<ExtractedDocument, ExtractionError> {
    let sniff = &raw[..raw.len().min(SNIFF_BYTES)];
    let adapter = adapter_for(path, sniff).ok_or_else(|| ExtractionError::UnsupportedFormat {
        path: path_string(path),
    })?;
    adapter.extract(path, raw)
}

pub(crate) fn path_string(path: &Path) -> String {
    path.display().to_string()
}

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
pub(crate) const MAX_ZIP_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Read one named entry from a ZIP archive, bounded by
/// [`MAX_ZIP_ENTRY_BYTES`].
pub(crate) fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, String> {
    use std::io::Read;

    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    entry
        .take(MAX_ZIP_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_ZIP_ENTRY_BYTES {
        return Err(format!("ZIP entry {name} exceeds size limit"));
    }
    Ok(out)
}

/// Lowercased file extension, if any.
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

/// Fallback title derived from the file name: stem split on `[._-]+`,
/// each part capitalized.
pub(crate) fn title_from_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parts: Vec<String> = STEM_SPLIT_RE
        .split(&stem)
        .filter(|p| !p.is_empty())
        .map(capitalize)
        .collect();
    if parts.is_empty() {
        stem
    } else {
        parts.join(" ")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
