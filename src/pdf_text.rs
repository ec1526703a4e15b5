//! Text layer of submitted PDF invoices.
//!
//! Supplier invoices exported from an ERP carry a text layer that anchors
//! the extraction prompt. Scanned invoices do not, and go to the vision
//! model as images only.

use lopdf::Document;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum TextLayer {
    Found(String),
    /// Scanned pages, or too little text to help.
    ImageOnly,
    Unreadable(String),
}

/// Fewer visible characters than this is a stray header or page number,
/// not an invoice body.
const MIN_VISIBLE_CHARS: usize = 30;

/// Share of image-only pages above which the invoice counts as scanned.
const SCANNED_PAGE_SHARE: f64 = 0.8;

pub fn read_text_layer(bytes: &[u8]) -> TextLayer {
    let doc = match Document::load_mem(bytes) {
        Ok(d) => d,
        Err(e) => return TextLayer::Unreadable(format!("invalid PDF: {e}")),
    };

    let share = image_only_share(&doc);
    if share >= SCANNED_PAGE_SHARE {
        debug!(share = format!("{share:.2}"), "Invoice pages are scans");
        return TextLayer::ImageOnly;
    }

    match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => {
            let visible = visible_chars(&text);
            debug!(chars = visible, "Invoice text layer");
            if visible < MIN_VISIBLE_CHARS { TextLayer::ImageOnly } else { TextLayer::Found(text) }
        }
        Err(e) => {
            warn!(error = %e, "No text layer could be read");
            TextLayer::ImageOnly
        }
    }
}

fn visible_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Pages drawing images without any font resource, as a share of all pages.
fn image_only_share(doc: &Document) -> f64 {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return 0.0;
    }

    let scanned = pages
        .values()
        .filter(|id| {
            let Some(page) = doc.get_object(**id).ok().and_then(|o| o.as_dict().ok()) else {
                return false;
            };
            let resources = page
                .get(b"Resources")
                .ok()
                .and_then(|r| doc.dereference(r).ok())
                .and_then(|(_, r)| r.as_dict().ok());
            let declares = |kind: &[u8]| {
                resources
                    .and_then(|res| res.get(kind).ok())
                    .and_then(|entry| doc.dereference(entry).ok())
                    .and_then(|(_, entry)| entry.as_dict().ok())
                    .is_some_and(|dict| !dict.is_empty())
            };
            declares(b"XObject") && !declares(b"Font")
        })
        .count();

    scanned as f64 / pages.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_pdf_bytes_are_unreadable() {
        assert!(matches!(read_text_layer(b"FACTURE F-1 total 120,00"), TextLayer::Unreadable(_)));
    }

    #[test]
    fn whitespace_does_not_count_as_text() {
        assert_eq!(visible_chars(" F-1\n\t 12 "), 5);
    }
}
