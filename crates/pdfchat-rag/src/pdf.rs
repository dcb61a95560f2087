use pdfchat_error::{PdfChatError, Result};
use tracing::{debug, instrument};

const PDF_MAGIC: &[u8] = b"%PDF";

/// True when the bytes carry the PDF header. Some writers emit a few bytes of
/// junk before it, so the first KiB is searched.
pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(PDF_MAGIC.len()).any(|w| w == PDF_MAGIC)
}

/// Extracts the plain text of a PDF. Parsing runs on the blocking pool.
#[instrument(skip(bytes), fields(size = bytes.len()))]
pub async fn extract_text(bytes: Vec<u8>) -> Result<String> {
    if !looks_like_pdf(&bytes) {
        return Err(PdfChatError::DocumentParse {
            message: "not a PDF file".to_string(),
        });
    }
    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| PdfChatError::DocumentParse {
            message: format!("pdf parser aborted: {}", e),
        })?
        .map_err(|e| PdfChatError::DocumentParse {
            message: e.to_string(),
        })?;
    debug!(chars = text.len(), "extracted pdf text");
    Ok(text)
}
