//! Vendor key normalization.
//!
//! Deterministic and idempotent: lowercase, NFKD-fold to ASCII
//! where possible, collapse runs of non-alphanumerics to a single `_`,
//! strip leading/trailing `_`.

use unicode_normalization::UnicodeNormalization;

const COMMON_SUFFIXES: &[&str] = &["inc", "llc", "ltd", "corp", "co"];

/// Normalize a vendor-name candidate into its canonical store key.
pub fn normalize_vendor_key(raw: &str) -> String {
    let folded: String = raw
        .nfkd()
        .filter(|c| c.is_ascii())
        .collect::<String>()
        .to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut last_was_sep = false;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }

    out.trim_matches('_').to_string()
}

/// Strip a single trailing legal-entity suffix token (`inc`, `llc`, ...)
/// from an already-normalized key, for fuzzy comparison purposes only.
/// Does not change the canonical store key.
pub fn strip_common_suffix(normalized: &str) -> &str {
    for suffix in COMMON_SUFFIXES {
        if let Some(stripped) = normalized.strip_suffix(&format!("_{suffix}")) {
            return stripped;
        }
        if normalized == *suffix {
            return "";
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_collapses_punctuation() {
        assert_eq!(normalize_vendor_key("Acme, Inc."), "acme_inc");
    }

    #[test]
    fn folds_diacritics() {
        assert_eq!(normalize_vendor_key("Café Résumé"), "cafe_resume");
    }

    #[test]
    fn strips_leading_and_trailing_separators() {
        assert_eq!(normalize_vendor_key("  -- Acme --  "), "acme");
    }

    #[test]
    fn is_idempotent() {
        let once = normalize_vendor_key("Acme Corp!! 2024");
        let twice = normalize_vendor_key(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_common_suffix_for_fuzzy_comparison() {
        assert_eq!(strip_common_suffix("acme_inc"), "acme");
        assert_eq!(strip_common_suffix("acme"), "acme");
    }
}
