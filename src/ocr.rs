//! Optional OCR for scanned PDF pages.
//!
//! OCR is a soft capability backed by the external `pdftoppm` and
//! `tesseract` binaries. Availability is probed once per process; when
//! either binary is missing a single warning is logged and every OCR
//! request reports [`OcrStatus::OcrSkipped`]. Page-level OCR failures
//! degrade to the sparse embedded text and never abort extraction.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Tesseract language packs used for every request.
pub const OCR_LANGUAGES: &str = "kaz+rus+tat+eng";

/// Render resolution for rasterized pages.
pub const OCR_DPI: &str = "300";

/// Outcome of an OCR attempt for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrStatus {
    /// Page had enough embedded text; OCR was not attempted.
    Embedded,
    OcrSuccess,
    OcrFailed,
    /// OCR ran but produced no text.
    OcrEmpty,
    /// OCR binaries unavailable.
    OcrSkipped,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Embedded => "embedded",
            OcrStatus::OcrSuccess => "ocr-success",
            OcrStatus::OcrFailed => "ocr-failed",
            OcrStatus::OcrEmpty => "ocr-empty",
            OcrStatus::OcrSkipped => "ocr-skipped",
        }
    }
}

static OCR_AVAILABLE: OnceLock<bool> = OnceLock::new();

fn binary_answers(name: &str, arg: &str) -> bool {
    Command::new(name)
        .arg(arg)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Probe the OCR toolchain once per process.
pub fn ocr_available() -> bool {
    *OCR_AVAILABLE.get_or_init(|| {
        let available = binary_answers("pdftoppm", "-v") && binary_answers("tesseract", "--version");
        if !available {
            warn!("pdftoppm/tesseract not found; scanned pages will keep their embedded text only");
        }
        available
    })
}

/// OCR a single 1-based PDF page. Returns the recognized text on success.
pub fn ocr_pdf_page(pdf_path: &Path, page_no: i64) -> (OcrStatus, Option<String>) {
    if !ocr_available() {
        return (OcrStatus::OcrSkipped, None);
    }
    match run_ocr(pdf_path, page_no) {
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                (OcrStatus::OcrEmpty, None)
            } else {
                (OcrStatus::OcrSuccess, Some(trimmed.to_string()))
            }
        }
        Err(detail) => {
            debug!(page = page_no, path = %pdf_path.display(), "OCR failed: {detail}");
            (OcrStatus::OcrFailed, None)
        }
    }
}

fn run_ocr(pdf_path: &Path, page_no: i64) -> Result<String, String> {
    let scratch = tempfile::tempdir().map_err(|e| format!("scratch dir: {e}"))?;
    let prefix = scratch.path().join("page");
    let page_arg = page_no.to_string();

    let render = Command::new("pdftoppm")
        .arg("-f")
        .arg(&page_arg)
        .arg("-l")
        .arg(&page_arg)
        .arg("-r")
        .arg(OCR_DPI)
        .arg("-png")
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .map_err(|e| format!("pdftoppm spawn: {e}"))?;
    if !render.status.success() {
        return Err(format!(
            "pdftoppm exited with {}: {}",
            render.status,
            String::from_utf8_lossy(&render.stderr).trim()
        ));
    }

    // pdftoppm pads the page suffix, so locate the produced image by scan.
    let image = std::fs::read_dir(scratch.path())
        .map_err(|e| format!("scratch dir scan: {e}"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|p| p.extension().is_some_and(|e| e == "png"))
        .ok_or_else(|| "pdftoppm produced no image".to_string())?;

    let out_base = scratch.path().join("ocr");
    let recognize = Command::new("tesseract")
        .arg(&image)
        .arg(&out_base)
        .arg("-l")
        .arg(OCR_LANGUAGES)
        .output()
        .map_err(|e| format!("tesseract spawn: {e}"))?;
    if !recognize.status.success() {
        return Err(format!(
            "tesseract exited with {}: {}",
            recognize.status,
            String::from_utf8_lossy(&recognize.stderr).trim()
        ));
    }

    std::fs::read_to_string(out_base.with_extension("txt")).map_err(|e| format!("ocr output: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_stable_across_calls() {
        assert_eq!(ocr_available(), ocr_available());
    }

    #[test]
    fn status_labels() {
        assert_eq!(OcrStatus::Embedded.as_str(), "embedded");
        assert_eq!(OcrStatus::OcrSkipped.as_str(), "ocr-skipped");
    }
}
