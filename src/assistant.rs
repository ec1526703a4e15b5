// src/assistant.rs

use crate::dashboard;
use crate::error::{AppError, Result};
use crate::gateway::{ChatGateway, ChatMessage};
use crate::models::DisputeStatus;
use crate::store::InvoiceStore;
use serde_json::json;
use tracing::{Instrument, info, info_span};

const EXPLAIN_PROMPT: &str = "Tu es un assistant comptable spécialisé dans le traitement des \
factures fournisseurs. On te donne le contexte complet d'une facture (données extraites, \
anomalies de rapprochement, bon de commande et bon de livraison associés, historique \
d'approbation, litiges). Explique en français, de façon concise et structurée, la cause \
probable de chaque anomalie puis propose les actions concrètes à mener. N'invente aucune \
donnée absente du contexte.";

const PILOTAGE_PROMPT: &str = "Tu es l'assistant de pilotage du service comptabilité \
fournisseurs. Réponds en français aux questions sur l'activité en t'appuyant uniquement \
sur les indicateurs fournis ci-dessous. Sois bref et chiffré; signale quand une \
information n'est pas disponible.";

/// Stream an explanation of an invoice's match anomalies. Every delta goes
/// to `sink`; the full text is returned.
pub async fn explain_anomaly(
    store: &InvoiceStore,
    gateway: &dyn ChatGateway,
    invoice_id: i64,
    sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
) -> Result<String> {
    let context = anomaly_context(store, invoice_id)?;
    let messages = vec![
        ChatMessage::system(EXPLAIN_PROMPT),
        ChatMessage::user(format!(
            "Contexte de la facture :\n```json\n{}\n```\n\nExplique les anomalies.",
            serde_json::to_string_pretty(&context)?
        )),
    ];
    let answer = gateway
        .stream(messages, sink)
        .instrument(info_span!("explain_anomaly", invoice_id))
        .await?;
    info!(invoice_id, chars = answer.len(), "Anomaly explanation streamed");
    Ok(answer)
}

/// Stream an answer to a free-text question about the current activity.
pub async fn ai_pilotage(
    store: &InvoiceStore,
    gateway: &dyn ChatGateway,
    question: &str,
    sink: &mut (dyn for<'s> FnMut(&'s str) + Send),
) -> Result<String> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AppError::Invalid("question is empty".into()));
    }
    let snapshot = dashboard::snapshot(store)?;
    let system = format!(
        "{PILOTAGE_PROMPT}\n\nIndicateurs actuels :\n```json\n{}\n```",
        serde_json::to_string_pretty(&snapshot)?
    );
    let messages = vec![ChatMessage::system(system), ChatMessage::user(question)];
    let answer = gateway
        .stream(messages, sink)
        .instrument(info_span!("ai_pilotage"))
        .await?;
    info!(chars = answer.len(), "Pilotage answer streamed");
    Ok(answer)
}

fn anomaly_context(store: &InvoiceStore, invoice_id: i64) -> Result<serde_json::Value> {
    let invoice = store.require_invoice(invoice_id)?;
    let purchase_order = match invoice.purchase_order_id {
        Some(id) => store.get_purchase_order(id)?,
        None => None,
    };
    let delivery_note = match invoice.delivery_note_id {
        Some(id) => store.get_delivery_note(id)?,
        None => None,
    };
    let supplier = match invoice.supplier_id {
        Some(id) => store.get_supplier(id)?,
        None => None,
    };
    let disputes: Vec<_> = store
        .disputes_for_invoice(invoice_id)?
        .into_iter()
        .filter(|d| d.status == DisputeStatus::Ouvert)
        .collect();

    Ok(json!({
        "anomalies": invoice.match_anomalies,
        "match_score": invoice.match_score,
        "match_status": invoice.match_status,
        "invoice": {
            "id": invoice.id,
            "status": invoice.status,
            "supplier_name": invoice.supplier_name,
            "invoice_number": invoice.invoice_number,
            "invoice_date": invoice.invoice_date,
            "due_date": invoice.due_date,
            "amount_ht": invoice.amount_ht,
            "amount_tva": invoice.amount_tva,
            "amount_ttc": invoice.amount_ttc,
            "currency": invoice.currency,
            "po_number": invoice.po_number,
            "bl_number": invoice.bl_number,
            "ocr_confidence": invoice.ocr_confidence,
        },
        "supplier": supplier,
        "purchase_order": purchase_order,
        "delivery_note": delivery_note,
        "approval_history": store.list_approval_history(invoice_id)?,
        "open_disputes": disputes,
    }))
}
