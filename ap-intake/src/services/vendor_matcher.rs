//! Vendor matching algorithm.
//!
//! Precedence, first match wins: exact → fuzzy → LLM-assisted → domain
//! fallback → none. Every step below the exact match only ever narrows
//! the candidate pool; none of them can fail in a way that blocks the
//! pipeline — a vendor-match failure degrades to `none`, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::PgPool;

use crate::cache::VendorCache;
use crate::contracts::enriched_invoice_v1::MatchMethod;
use crate::normalize::{normalize_vendor_key, strip_common_suffix};
use crate::repos::vendor_repo::{self, VendorRow};
use crate::services::llm_client::LlmClient;

#[derive(Debug, Clone)]
pub struct VendorMatch {
    pub vendor: Option<VendorRow>,
    pub confidence: u8,
    pub method: MatchMethod,
}

impl VendorMatch {
    fn none() -> Self {
        Self {
            vendor: None,
            confidence: 0,
            method: MatchMethod::None,
        }
    }
}

/// Candidate text pulled from the PDF or subject-line heuristics, plus
/// the sender address used for the domain-fallback step.
pub struct MatchInput<'a> {
    pub vendor_name_candidate: Option<&'a str>,
    pub sender_email: &'a str,
    pub subject: &'a str,
}

// Subject lines commonly read "Invoice from Acme Inc", "RE: Acme Inc -
// Invoice #123", or "Acme Inc Invoice"; try the "from <name>" shape
// first since it is the least ambiguous, then a leading "<name> -
// invoice" shape.
static SUBJECT_FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bfrom\s+([A-Za-z0-9&.,' -]{2,60}?)(?:\s*[-:|]|\s+invoice\b|$)")
        .expect("valid regex")
});
static SUBJECT_LEADING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([A-Za-z0-9&.,' ]{2,60}?)\s*[-:|]\s*invoice\b").expect("valid regex")
});

/// Best-effort vendor-name guess from a subject line, consulted only
/// when no PDF-derived candidate exists. Mirrors the "from"/"vendor"
/// line heuristics `pdf_extractor` applies to document text.
fn derive_subject_candidate(subject: &str) -> Option<String> {
    SUBJECT_FROM_RE
        .captures(subject)
        .or_else(|| SUBJECT_LEADING_RE.captures(subject))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

pub struct VendorMatcher<'a> {
    pool: &'a PgPool,
    cache: &'a VendorCache,
    llm: Option<&'a LlmClient>,
    fuzzy_threshold: u8,
}

impl<'a> VendorMatcher<'a> {
    pub fn new(
        pool: &'a PgPool,
        cache: &'a VendorCache,
        llm: Option<&'a LlmClient>,
        fuzzy_threshold: u8,
    ) -> Self {
        Self {
            pool,
            cache,
            llm,
            fuzzy_threshold,
        }
    }

    pub async fn match_vendor(
        &self,
        input: &MatchInput<'_>,
    ) -> Result<VendorMatch, vendor_repo::VendorError> {
        // A PDF-derived candidate always wins when present; subject-line
        // heuristics only fill in when PDF extraction found nothing (or
        // is disabled), which is the common case.
        let subject_candidate = input
            .vendor_name_candidate
            .is_none()
            .then(|| derive_subject_candidate(input.subject))
            .flatten();
        let candidate = input.vendor_name_candidate.or(subject_candidate.as_deref());

        if let Some(candidate) = candidate {
            if let Some(hit) = self.try_exact(candidate).await? {
                return Ok(hit);
            }
        }

        let active = vendor_repo::list_active(self.pool).await?;

        if let Some(candidate) = candidate {
            if let Some(hit) = self.try_fuzzy(candidate, &active) {
                return Ok(hit);
            }
        }

        if let Some(llm) = self.llm {
            if let Some(candidate) = candidate {
                if let Some(hit) = self.try_llm(llm, candidate, &active).await {
                    return Ok(hit);
                }
            }
        }

        if let Some(hit) = self.try_domain(input.sender_email).await? {
            return Ok(hit);
        }

        Ok(VendorMatch::none())
    }

    async fn try_exact(
        &self,
        candidate: &str,
    ) -> Result<Option<VendorMatch>, vendor_repo::VendorError> {
        let key = normalize_vendor_key(candidate);
        let vendor = self.cache.lookup(self.pool, &key).await?;
        Ok(vendor.filter(|v| v.active).map(|v| VendorMatch {
            vendor: Some((*v).clone()),
            confidence: 100,
            method: MatchMethod::Exact,
        }))
    }

    fn try_fuzzy(&self, candidate: &str, active: &[VendorRow]) -> Option<VendorMatch> {
        let candidate_key = normalize_vendor_key(candidate);
        let candidate_folded = strip_common_suffix(&candidate_key);

        let mut best: Option<(u8, &VendorRow)> = None;
        for vendor in active {
            let vendor_key = normalize_vendor_key(&vendor.vendor_name);
            let vendor_folded = strip_common_suffix(&vendor_key);
            let score = token_set_ratio(candidate_folded, vendor_folded);
            if best.map(|(b, _)| score > b).unwrap_or(true) {
                best = Some((score, vendor));
            }
        }

        best.filter(|(score, _)| *score >= self.fuzzy_threshold)
            .map(|(score, vendor)| VendorMatch {
                vendor: Some(vendor.clone()),
                confidence: score,
                method: MatchMethod::Fuzzy,
            })
    }

    async fn try_llm(
        &self,
        llm: &LlmClient,
        candidate: &str,
        active: &[VendorRow],
    ) -> Option<VendorMatch> {
        let shortlist: Vec<&str> = active.iter().map(|v| v.vendor_name.as_str()).take(25).collect();
        let suggestion = llm.pick_vendor(candidate, &shortlist).await.ok()??;

        let vendor = active
            .iter()
            .find(|v| v.vendor_name.eq_ignore_ascii_case(&suggestion.vendor_name))?;

        let confidence = suggestion.certainty.max(self.fuzzy_threshold);
        Some(VendorMatch {
            vendor: Some(vendor.clone()),
            confidence,
            method: MatchMethod::Ai,
        })
    }

    async fn try_domain(
        &self,
        sender_email: &str,
    ) -> Result<Option<VendorMatch>, vendor_repo::VendorError> {
        let Some(domain) = sender_email.split('@').nth(1) else {
            return Ok(None);
        };
        let base = domain.split('.').next().unwrap_or(domain);
        let key = normalize_vendor_key(base);
        let vendor = self.cache.lookup(self.pool, &key).await?;
        Ok(vendor.filter(|v| v.active).map(|v| VendorMatch {
            vendor: Some((*v).clone()),
            confidence: 40,
            method: MatchMethod::Domain,
        }))
    }
}

/// Token-set ratio: split both strings on `_`, compare the sorted,
/// deduplicated token sets, score by longest-common-subsequence
/// similarity of the joined sorted sets via `strsim::jaro_winkler`.
/// Diacritic and case folding already happened in `normalize_vendor_key`.
fn token_set_ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let sorted_tokens = |s: &str| -> String {
        let mut tokens: Vec<&str> = s.split('_').filter(|t| !t.is_empty()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        tokens.join("_")
    };

    let sa = sorted_tokens(a);
    let sb = sorted_tokens(b);
    let score = strsim::jaro_winkler(&sa, &sb);
    (score * 100.0).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_set_ratio_scores_identical_strings_perfectly() {
        assert_eq!(token_set_ratio("acme", "acme"), 100);
    }

    #[test]
    fn token_set_ratio_is_order_insensitive() {
        let a = token_set_ratio("north_acme", "acme_north");
        assert_eq!(a, 100);
    }

    #[test]
    fn token_set_ratio_handles_empty_input() {
        assert_eq!(token_set_ratio("", "acme"), 0);
    }

    #[test]
    fn derives_candidate_from_from_phrase() {
        assert_eq!(
            derive_subject_candidate("Invoice from Acme Inc - March").as_deref(),
            Some("Acme Inc")
        );
    }

    #[test]
    fn derives_candidate_from_leading_dash_shape() {
        assert_eq!(
            derive_subject_candidate("Acme Inc - Invoice #123").as_deref(),
            Some("Acme Inc")
        );
    }

    #[test]
    fn returns_none_for_subject_without_recognizable_shape() {
        assert_eq!(derive_subject_candidate("Your monthly statement"), None);
    }
}
