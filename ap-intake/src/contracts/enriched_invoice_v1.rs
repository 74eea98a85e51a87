//! EnrichedInvoice contract, published to the `to-post` queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CURRENT_SCHEMA_VERSION;
use super::raw_mail_v1::RawMailV1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Enriched,
    Unknown,
    Reseller,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Exact,
    Fuzzy,
    Ai,
    Domain,
    None,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::Ai => "ai",
            MatchMethod::Domain => "domain",
            MatchMethod::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedInvoiceV1 {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    pub id: String,
    pub original_message_id: String,
    pub sender: String,
    pub subject: String,
    pub blob_url: String,
    pub received_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_terms: Option<String>,

    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expense_dept: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gl_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_party: Option<String>,

    pub status: InvoiceStatus,
    pub recipient_email: String,
    pub match_confidence: u8,
    pub match_method: MatchMethod,

    /// Set when the Enricher's optional same-invoice-different-id check
    /// (`find_candidate_duplicate`) found a hit but the pipeline is
    /// configured to annotate rather than block (the default). Carried
    /// through to the Router so the transaction row records the
    /// suspected duplicate without refusing delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_duplicate_of: Option<String>,
}

fn default_schema_version() -> String {
    CURRENT_SCHEMA_VERSION.to_string()
}

impl EnrichedInvoiceV1 {
    /// Carry forward the RawMail fields verbatim; the caller fills in
    /// vendor/status/recipient/match fields.
    pub fn from_raw_mail(
        raw: &RawMailV1,
        vendor_name: String,
        status: InvoiceStatus,
        recipient_email: String,
        match_confidence: u8,
        match_method: MatchMethod,
    ) -> Self {
        Self {
            schema_version: default_schema_version(),
            id: raw.id.clone(),
            original_message_id: raw.original_message_id.clone(),
            sender: raw.sender.clone(),
            subject: raw.subject.clone(),
            blob_url: raw.blob_url.clone(),
            received_at: raw.received_at,
            invoice_amount: raw.invoice_amount,
            currency: raw.currency.clone(),
            due_date: raw.due_date.clone(),
            payment_terms: raw.payment_terms.clone(),
            vendor_name,
            expense_dept: None,
            gl_code: None,
            allocation_schedule: None,
            billing_party: None,
            status,
            recipient_email,
            match_confidence,
            match_method,
            candidate_duplicate_of: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawMailV1 {
        RawMailV1 {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            id: "evt-1".to_string(),
            original_message_id: "M-001".to_string(),
            sender: "billing@acme.com".to_string(),
            subject: "Invoice #123".to_string(),
            blob_url: "2024/01/02/evt-1.pdf".to_string(),
            received_at: Utc::now(),
            vendor_name: None,
            invoice_amount: Some(1234.0),
            currency: Some("USD".to_string()),
            due_date: None,
            payment_terms: None,
        }
    }

    #[test]
    fn from_raw_mail_carries_fields_and_leaves_duplicate_annotation_unset() {
        let raw = sample_raw();
        let enriched = EnrichedInvoiceV1::from_raw_mail(
            &raw,
            "Acme Inc".to_string(),
            InvoiceStatus::Enriched,
            "ap@acme.com".to_string(),
            100,
            MatchMethod::Exact,
        );
        assert_eq!(enriched.original_message_id, "M-001");
        assert_eq!(enriched.vendor_name, "Acme Inc");
        assert!(enriched.candidate_duplicate_of.is_none());
    }
}
