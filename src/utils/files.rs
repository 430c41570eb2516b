//! Filename helpers for downloaded documents.

use std::path::Path;

/// Replace filesystem-reserved characters so a document type can be embedded
/// in a filename.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = sanitized.trim().trim_matches('_');
    if trimmed.len() > 100 {
        trimmed[..100].to_string()
    } else if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The upstream names downloads after the bare document number. When the stem
/// is exactly an 8-digit number, prepend the document type so archived files
/// are self-describing; anything else passes through unchanged.
pub fn describe_filename(suggested: &str, doc_type: &str) -> String {
    let path = Path::new(suggested);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");

    if stem.len() == 8 && stem.chars().all(|c| c.is_ascii_digit()) {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let doc_type = if doc_type.is_empty() { "Document" } else { doc_type };
        sanitize_filename(&format!("{doc_type}_{stem}")) + &ext
    } else {
        suggested.to_string()
    }
}

/// Whether the downloaded file needs HTML→PDF conversion.
pub fn is_html_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm")
    )
}
