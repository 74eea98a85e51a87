//! PDF / LLM vendor extractor.
//!
//! Parses text from an attached PDF and applies regex-based field
//! heuristics. Any failure here — unreadable PDF, no regex hit — simply
//! leaves the corresponding field unset; the Enricher's domain fallback
//! and `status = unknown` path absorb the gap. This module never
//! propagates an error that would dead-letter a message.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::services::llm_client::LlmClient;

const MAX_PAGES: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub vendor_name_candidate: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub due_date: Option<String>,
    pub payment_terms: Option<String>,
}

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\$|USD|EUR|CAD)\s?([0-9][0-9,]*\.?[0-9]{0,2})|([0-9][0-9,]*\.[0-9]{2})\s?(?:USD|EUR|CAD)")
        .expect("valid regex")
});

static CURRENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(USD|EUR|CAD)\b|\$").expect("valid regex"));

static DUE_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)due\s*(?:date)?\s*[:\-]?\s*(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4}|\d{1,2}\s+\w+\s+\d{4}|\w+\s+\d{1,2},?\s+\d{4})",
    )
    .expect("valid regex")
});

static TERMS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(net\s*\d{1,3}|due\s+on\s+receipt)").expect("valid regex"));

static VENDOR_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*(?:from|vendor|bill\s*from)\s*[:\-]\s*(.+)$").expect("valid regex"));

/// Extract the first `MAX_PAGES` pages of text from `pdf_bytes` and run
/// regex heuristics over it. Falls back to the LLM, if configured, when
/// no vendor-name candidate is found.
pub async fn extract(pdf_bytes: &[u8], llm: Option<&LlmClient>) -> ExtractedFields {
    let text = match extract_text_bounded(pdf_bytes) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "pdf text extraction failed, leaving fields unset");
            return ExtractedFields::default();
        }
    };

    let mut fields = apply_heuristics(&text);

    if fields.vendor_name_candidate.is_none() {
        if let Some(llm) = llm {
            fields.vendor_name_candidate = llm_vendor_fallback(llm, &text).await;
        }
    }

    fields
}

fn extract_text_bounded(pdf_bytes: &[u8]) -> Result<String, pdf_extract::OutputError> {
    // pdf-extract has no page-count cap of its own; bound the amount of
    // text we feed into the regexes afterward instead of re-parsing.
    let full_text = pdf_extract::extract_text_from_mem(pdf_bytes)?;
    let bounded: String = full_text
        .split('\x0c') // form-feed page separator emitted between pages
        .take(MAX_PAGES)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(bounded)
}

fn apply_heuristics(text: &str) -> ExtractedFields {
    let amount = AMOUNT_RE.captures(text).and_then(|caps| {
        let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
        raw.replace(',', "").parse::<f64>().ok()
    });

    let currency = CURRENCY_RE.captures(text).map(|caps| {
        if let Some(m) = caps.get(1) {
            m.as_str().to_uppercase()
        } else {
            "USD".to_string()
        }
    });

    let due_date = DUE_DATE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let payment_terms = TERMS_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let vendor_name_candidate = VENDOR_LINE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    ExtractedFields {
        vendor_name_candidate,
        amount,
        currency,
        due_date,
        payment_terms,
    }
}

async fn llm_vendor_fallback(llm: &LlmClient, text: &str) -> Option<String> {
    // No short-list is available at extraction time (that's the
    // matcher's job); ask for a free-form candidate by passing the
    // extractor's own output as the sole "candidate" to refine.
    let excerpt: String = text.chars().take(2000).collect();
    llm.pick_vendor(&excerpt, &[excerpt.as_str()])
        .await
        .ok()
        .flatten()
        .map(|s| s.vendor_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_dollar_amount() {
        let fields = apply_heuristics("Invoice Total: $1,234.56 due on receipt");
        assert_eq!(fields.amount, Some(1234.56));
        assert_eq!(fields.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn extracts_iso_due_date() {
        let fields = apply_heuristics("Due Date: 2024-03-15\nPayment Terms: Net 30");
        assert_eq!(fields.due_date.as_deref(), Some("2024-03-15"));
        assert_eq!(fields.payment_terms.as_deref(), Some("Net 30"));
    }

    #[test]
    fn extracts_vendor_line() {
        let fields = apply_heuristics("From: Acme Inc\nInvoice #123");
        assert_eq!(fields.vendor_name_candidate.as_deref(), Some("Acme Inc"));
    }

    #[test]
    fn missing_fields_stay_none() {
        let fields = apply_heuristics("no structured content here");
        assert!(fields.amount.is_none());
        assert!(fields.vendor_name_candidate.is_none());
    }
}
