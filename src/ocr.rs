// src/ocr.rs

use crate::documents::{DocumentStore, mime_for};
use crate::error::{AppError, Result};
use crate::extraction::{ExtractedInvoice, FieldValue};
use crate::gateway::{ChatGateway, ChatMessage, ContentPart, ImageUrl};
use crate::heuristics;
use crate::matching::{MatchOutcome, Matcher};
use crate::models::{InvoiceStatus, NewInvoice};
use crate::pdf_text::{TextLayer, read_text_layer};
use crate::store::{ExtractionUpdate, InvoiceStore};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{Instrument, info, info_span, warn};

/// Instructions sent with every document.
const EXTRACTION_PROMPT: &str = r#"Tu es un assistant d'extraction de factures fournisseurs.
On te fournit une facture (image ou PDF, parfois accompagnée de sa couche texte).
Retourne UNIQUEMENT un objet JSON valide, sans balises markdown ni commentaire.

Chaque champ est un objet {"value": ..., "confidence": nombre entre 0 et 1}:
{
  "supplier_name":  {"value": "string ou null", "confidence": 0.0},
  "supplier_siret": {"value": "14 chiffres ou null", "confidence": 0.0},
  "supplier_vat":   {"value": "numéro de TVA intracommunautaire ou null", "confidence": 0.0},
  "invoice_number": {"value": "string ou null", "confidence": 0.0},
  "invoice_date":   {"value": "YYYY-MM-DD ou null", "confidence": 0.0},
  "due_date":       {"value": "YYYY-MM-DD ou null", "confidence": 0.0},
  "amount_ht":      {"value": nombre ou null, "confidence": 0.0},
  "amount_tva":     {"value": nombre ou null, "confidence": 0.0},
  "amount_ttc":     {"value": nombre ou null, "confidence": 0.0},
  "currency":       {"value": "code ISO (EUR, USD...) ou null", "confidence": 0.0},
  "po_number":      {"value": "numéro de bon de commande ou null", "confidence": 0.0},
  "bl_number":      {"value": "numéro de bon de livraison ou null", "confidence": 0.0}
}

Règles:
- Utilise null quand une information est absente ou illisible, avec confidence 0.
- Les montants sont des nombres décimaux avec un point (1234.56), sans symbole monétaire.
- Ne devine pas: une valeur incertaine reçoit une confidence faible."#;

/// Text-layer excerpt size sent alongside the document.
const MAX_TEXT_CHARS: usize = 12_000;
/// Confidence given to bare values returned without a confidence object.
const BARE_VALUE_CONFIDENCE: f64 = 0.5;

/// Where the fields come from.
pub enum ExtractionBackend<'a> {
    Model(&'a dyn ChatGateway),
    Heuristics,
}

#[derive(Debug, Clone, Serialize)]
pub struct OcrOutcome {
    pub invoice_id: i64,
    pub fields: ExtractedInvoice,
    pub confidence: f64,
    pub filled: usize,
    pub status: InvoiceStatus,
    pub matched: Option<MatchOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub invoice_id: i64,
    pub file_key: String,
    pub duplicate: bool,
}

/// Store a file and create its invoice. A file already seen (same SHA-256)
/// returns the existing invoice.
pub fn submit_invoice(store: &InvoiceStore, docs: &DocumentStore, path: &Path) -> Result<Submission> {
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document")
        .to_string();
    submit_bytes(store, docs, &file_name, &bytes)
}

pub fn submit_bytes(
    store: &InvoiceStore,
    docs: &DocumentStore,
    file_name: &str,
    bytes: &[u8],
) -> Result<Submission> {
    if bytes.is_empty() {
        return Err(AppError::Invalid(format!("{file_name} is empty")));
    }
    let hash = DocumentStore::hash_bytes(bytes);
    if let Some(existing) = store.find_invoice_by_hash(&hash)? {
        warn!(
            invoice_id = existing.id,
            file_name, "File already submitted, returning existing invoice"
        );
        return Ok(Submission {
            invoice_id: existing.id,
            file_key: existing.file_key,
            duplicate: true,
        });
    }
    let stored = docs.put(file_name, bytes)?;
    let invoice_id = store.insert_invoice(&NewInvoice {
        file_key: stored.key.clone(),
        file_name: file_name.to_string(),
        file_hash: stored.hash,
    })?;
    Ok(Submission {
        invoice_id,
        file_key: stored.key,
        duplicate: false,
    })
}

/// Run extraction on a stored invoice, write the fields back and, when a
/// PO or BL number was read, run matching.
pub async fn process_invoice(
    store: &InvoiceStore,
    docs: &DocumentStore,
    backend: &ExtractionBackend<'_>,
    invoice_id: i64,
) -> Result<OcrOutcome> {
    extract_and_match(store, docs, backend, invoice_id)
        .instrument(info_span!("process_ocr", invoice_id))
        .await
}

async fn extract_and_match(
    store: &InvoiceStore,
    docs: &DocumentStore,
    backend: &ExtractionBackend<'_>,
    invoice_id: i64,
) -> Result<OcrOutcome> {
    let invoice = store.require_invoice(invoice_id)?;
    if !matches!(
        invoice.status,
        InvoiceStatus::Nouvelle
            | InvoiceStatus::AValiderExtraction
            | InvoiceStatus::ARapprocher
            | InvoiceStatus::Exception
    ) {
        return Err(AppError::Invalid(format!(
            "invoice {invoice_id} is {} and can no longer be re-extracted",
            invoice.status
        )));
    }
    let bytes = docs.read(&invoice.file_key)?;
    let text_layer = text_layer(&invoice.file_name, &bytes);

    let fields = match backend {
        ExtractionBackend::Model(gateway) => {
            let messages = build_messages(&invoice.file_name, &bytes, text_layer.as_deref());
            let reply = gateway.complete(messages).await?;
            parse_extraction(&reply)
        }
        ExtractionBackend::Heuristics => match text_layer.as_deref() {
            Some(text) => heuristics::extract_invoice(text),
            None => {
                warn!("No text layer: heuristics cannot read this document");
                ExtractedInvoice::default()
            }
        },
    };

    let confidence = fields.mean_confidence();
    let (filled, total) = fields.coverage();
    info!(
        filled,
        total,
        confidence = format!("{confidence:.2}"),
        invoice_number = ?fields.invoice_number.value,
        supplier = ?fields.supplier_name.value,
        "Extraction result"
    );
    store.update_extraction(
        invoice_id,
        &ExtractionUpdate {
            fields: &fields,
            confidence,
            status: InvoiceStatus::AValiderExtraction,
        },
    )?;

    let matched = if fields.has_matching_reference() {
        Some(Matcher::new(store).match_invoice(invoice_id)?)
    } else {
        None
    };
    let status = matched
        .as_ref()
        .map_or(InvoiceStatus::AValiderExtraction, |m| m.status);

    Ok(OcrOutcome {
        invoice_id,
        fields,
        confidence,
        filled,
        status,
        matched,
    })
}

/// Confirm a reviewed extraction and reconcile it.
pub fn validate_extraction(store: &InvoiceStore, invoice_id: i64) -> Result<MatchOutcome> {
    let invoice = store.require_invoice(invoice_id)?;
    if invoice.status != InvoiceStatus::AValiderExtraction {
        return Err(AppError::Invalid(format!(
            "invoice {invoice_id} is {}, expected {}",
            invoice.status,
            InvoiceStatus::AValiderExtraction
        )));
    }
    store.set_invoice_status(invoice_id, InvoiceStatus::ARapprocher)?;
    Matcher::new(store).match_invoice(invoice_id)
}

fn text_layer(file_name: &str, bytes: &[u8]) -> Option<String> {
    if mime_for(file_name) != "application/pdf" {
        return None;
    }
    match read_text_layer(bytes) {
        TextLayer::Found(text) => Some(text),
        TextLayer::ImageOnly => None,
        TextLayer::Unreadable(e) => {
            warn!(error = %e, "Unreadable PDF, sending the raw file only");
            None
        }
    }
}

fn build_messages(file_name: &str, bytes: &[u8], text_layer: Option<&str>) -> Vec<ChatMessage> {
    let mut instruction = format!("Extrais les données de cette facture (fichier : {file_name}).");
    if let Some(text) = text_layer {
        instruction.push_str("\n\nCouche texte du PDF :\n\n");
        instruction.push_str(truncate_chars(text, MAX_TEXT_CHARS));
    }
    let data_uri = format!(
        "data:{};base64,{}",
        mime_for(file_name),
        STANDARD.encode(bytes)
    );
    vec![
        ChatMessage::system(EXTRACTION_PROMPT),
        ChatMessage::user_parts(vec![
            ContentPart::Text { text: instruction },
            ContentPart::ImageUrl {
                image_url: ImageUrl { url: data_uri },
            },
        ]),
    ]
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding text (reasoning tokens, prose).
pub fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

/// Parse a model reply. Anything unusable degrades to the empty,
/// zero-confidence extraction.
pub fn parse_extraction(reply: &str) -> ExtractedInvoice {
    // Strip markdown fences if the model added them despite instructions
    let trimmed = reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let Some(json) = extract_json_object(trimmed) else {
        warn!(reply_len = reply.len(), "No JSON object in model reply");
        return ExtractedInvoice::default();
    };
    match serde_json::from_str::<Value>(json) {
        Ok(value @ Value::Object(_)) => fields_from_json(&value).normalized(),
        Ok(_) => {
            warn!("Model reply is not a JSON object");
            ExtractedInvoice::default()
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse model reply as JSON");
            ExtractedInvoice::default()
        }
    }
}

fn fields_from_json(v: &Value) -> ExtractedInvoice {
    ExtractedInvoice {
        supplier_name: text_field(v, "supplier_name"),
        supplier_siret: text_field(v, "supplier_siret"),
        supplier_vat: text_field(v, "supplier_vat"),
        invoice_number: text_field(v, "invoice_number"),
        invoice_date: text_field(v, "invoice_date"),
        due_date: text_field(v, "due_date"),
        amount_ht: amount_field(v, "amount_ht"),
        amount_tva: amount_field(v, "amount_tva"),
        amount_ttc: amount_field(v, "amount_ttc"),
        currency: text_field(v, "currency"),
        po_number: text_field(v, "po_number"),
        bl_number: text_field(v, "bl_number"),
    }
}

/// `{"value": x, "confidence": c}`, or a bare `x`.
fn split_field<'v>(v: &'v Value, key: &str) -> Option<(&'v Value, f64)> {
    let field = v.get(key)?;
    match field {
        Value::Object(obj) => {
            let confidence = obj.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
            obj.get("value").map(|value| (value, confidence))
        }
        Value::Null => None,
        bare => Some((bare, BARE_VALUE_CONFIDENCE)),
    }
}

fn text_field(v: &Value, key: &str) -> FieldValue<String> {
    let Some((value, confidence)) = split_field(v, key) else {
        return FieldValue::default();
    };
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return FieldValue::default(),
    };
    FieldValue::new(text, confidence)
}

fn amount_field(v: &Value, key: &str) -> FieldValue<f64> {
    let Some((value, confidence)) = split_field(v, key) else {
        return FieldValue::default();
    };
    let amount = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => heuristics::parse_amount(s),
        _ => None,
    };
    match amount {
        Some(a) if a.is_finite() => FieldValue::new(a, confidence),
        _ => FieldValue::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::temp_root;
    use crate::gateway::MessageContent;
    use crate::gateway::testing::ScriptedGateway;
    use crate::models::{MatchStatus, NewPurchaseOrder, NewSupplier};

    const REPLY: &str = r#"Voici le résultat :
```json
{
  "supplier_name": {"value": "ACME Fournitures", "confidence": 0.95},
  "supplier_siret": {"value": "12345678900012", "confidence": 0.9},
  "invoice_number": {"value": "F-2025-0042", "confidence": 0.9},
  "amount_ht": {"value": 1000.0, "confidence": 0.9},
  "amount_ttc": {"value": "1 200,00", "confidence": 0.9},
  "po_number": {"value": "PO-2025-017", "confidence": 0.8},
  "bl_number": {"value": "", "confidence": 0.6},
  "currency": "EUR"
}
```"#;

    #[test]
    fn replies_with_fences_and_prose_are_parsed() {
        let fields = parse_extraction(REPLY);
        assert_eq!(fields.invoice_number.value.as_deref(), Some("F-2025-0042"));
        assert_eq!(fields.amount_ttc.value, Some(1200.0));
        assert_eq!(fields.currency.value.as_deref(), Some("EUR"));
        assert_eq!(fields.currency.confidence, BARE_VALUE_CONFIDENCE);
        assert!(fields.bl_number.value.is_none());
        assert_eq!(fields.bl_number.confidence, 0.0);
        assert!(fields.due_date.value.is_none());
    }

    #[test]
    fn unusable_replies_degrade_to_empty_fields() {
        for reply in ["désolé, je ne peux pas", "{not json}", "[1, 2]", ""] {
            let fields = parse_extraction(reply);
            assert_eq!(fields, ExtractedInvoice::default(), "reply: {reply}");
            assert_eq!(fields.mean_confidence(), 0.0);
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("éété", 2), "éé");
        assert_eq!(truncate_chars("été!", 3), "été");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn submission_deduplicates_by_content() {
        let root = temp_root("submit");
        let store = InvoiceStore::open_in_memory().unwrap();
        let docs = DocumentStore::new(&root);
        let first = submit_bytes(&store, &docs, "a.png", b"same bytes").unwrap();
        let again = submit_bytes(&store, &docs, "b.png", b"same bytes").unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(first.invoice_id, again.invoice_id);
        assert_eq!(store.list_invoices(None).unwrap().len(), 1);
        assert!(submit_bytes(&store, &docs, "c.png", b"").is_err());
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn model_extraction_then_matching() {
        let root = temp_root("ocr");
        let store = InvoiceStore::open_in_memory().unwrap();
        let docs = DocumentStore::new(&root);
        let supplier = store
            .insert_supplier(&NewSupplier {
                name: "ACME Fournitures".into(),
                siret: Some("12345678900012".into()),
                ..Default::default()
            })
            .unwrap();
        store
            .insert_purchase_order(&NewPurchaseOrder {
                po_number: "PO-2025-017".into(),
                supplier_id: Some(supplier),
                amount_ttc: Some(1200.0),
                ..Default::default()
            })
            .unwrap();
        let sub = submit_bytes(&store, &docs, "scan.png", b"\x89PNG fake").unwrap();

        let gateway = ScriptedGateway::replying(vec![Ok(REPLY.to_string())]);
        let outcome = process_invoice(&store, &docs, &ExtractionBackend::Model(&gateway), sub.invoice_id)
            .await
            .unwrap();

        let matched = outcome.matched.expect("PO number triggers matching");
        assert_eq!(matched.supplier_id, Some(supplier));
        assert_eq!(matched.match_status, MatchStatus::MatchProbable);
        assert_eq!(outcome.status, InvoiceStatus::ARapprocher);

        let inv = store.require_invoice(sub.invoice_id).unwrap();
        assert_eq!(inv.amount_ttc, Some(1200.0));
        assert!(inv.ocr_confidence.unwrap() > 0.0);

        let requests = gateway.requests.lock().unwrap();
        let MessageContent::Parts(parts) = &requests[0][1].content else {
            panic!("user message should be multimodal");
        };
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:image/png;base64,")
        ));
        drop(requests);
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn gateway_limits_are_not_degraded() {
        let root = temp_root("ocr_limit");
        let store = InvoiceStore::open_in_memory().unwrap();
        let docs = DocumentStore::new(&root);
        let sub = submit_bytes(&store, &docs, "scan.jpg", b"jpeg").unwrap();
        let gateway = ScriptedGateway::replying(vec![Err(AppError::RateLimited)]);

        let err = process_invoice(&store, &docs, &ExtractionBackend::Model(&gateway), sub.invoice_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited));
        assert_eq!(
            store.require_invoice(sub.invoice_id).unwrap().status,
            InvoiceStatus::Nouvelle
        );
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn heuristics_without_text_layer_leave_fields_for_review() {
        let root = temp_root("ocr_heur");
        let store = InvoiceStore::open_in_memory().unwrap();
        let docs = DocumentStore::new(&root);
        let sub = submit_bytes(&store, &docs, "photo.jpg", b"jpeg bytes").unwrap();

        let outcome = process_invoice(&store, &docs, &ExtractionBackend::Heuristics, sub.invoice_id)
            .await
            .unwrap();
        assert!(outcome.matched.is_none());
        assert_eq!(outcome.filled, 0);
        assert_eq!(outcome.status, InvoiceStatus::AValiderExtraction);

        let matched = validate_extraction(&store, sub.invoice_id).unwrap();
        assert_eq!(matched.match_status, MatchStatus::AucunMatch);
        assert!(matches!(
            validate_extraction(&store, sub.invoice_id),
            Err(AppError::Invalid(_))
        ));
        std::fs::remove_dir_all(root).ok();
    }
}
