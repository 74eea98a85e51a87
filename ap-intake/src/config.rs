use std::env;
use std::time::Duration;

/// Application configuration parsed from environment variables.
///
/// Constructed once at startup and threaded through every component
/// constructor; nothing in this crate re-reads the environment after
/// `from_env` returns.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: String,
    pub nats_url: String,
    pub host: String,
    pub port: u16,

    pub ingest_mailbox: String,
    pub ap_email_address: String,
    pub allowed_ap_emails: Vec<String>,
    pub vendor_registration_mailbox: String,
    pub reseller_mailbox: String,

    pub mail_webhook_url: String,
    pub graph_client_state: String,
    pub graph_api_base_url: String,
    pub graph_bearer_token: String,

    pub chat_webhook_url: String,

    pub blob_store_root: String,

    pub vendor_fuzzy_threshold: u8,

    pub rate_limit_disabled: bool,
    pub rate_limit_per_minute: u32,

    pub mail_ingest_enabled: bool,
    pub poll_interval: Duration,
    pub poll_page_size: u32,

    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub pdf_pre_extraction_enabled: bool,

    pub function_app_url: String,

    pub dedup_window_days: i64,
    pub candidate_dup_blocks: bool,

    pub dead_letter_threshold: i32,
    pub visibility_timeout: Duration,

    pub retry_base_delay: Duration,
    pub retry_factor: u32,
    pub retry_cap: Duration,
    pub retry_max_attempts: u32,

    pub breaker_failure_threshold: u32,
    pub breaker_open_duration: Duration,

    pub subscription_renew_window: Duration,
    pub subscription_check_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus_type = env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string());
        let nats_url =
            env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let ingest_mailbox =
            env::var("INGEST_MAILBOX").map_err(|_| "INGEST_MAILBOX must be set".to_string())?;
        let ap_email_address = env::var("AP_EMAIL_ADDRESS")
            .map_err(|_| "AP_EMAIL_ADDRESS must be set".to_string())?;

        if ap_email_address.eq_ignore_ascii_case(&ingest_mailbox) {
            return Err(
                "AP_EMAIL_ADDRESS must differ from INGEST_MAILBOX (loop guard)".to_string(),
            );
        }

        let allowed_ap_emails = env::var("ALLOWED_AP_EMAILS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let vendor_registration_mailbox = env::var("VENDOR_REGISTRATION_MAILBOX")
            .unwrap_or_else(|_| format!("vendor-registration@{}", domain_of(&ap_email_address)));
        let reseller_mailbox = env::var("RESELLER_MAILBOX")
            .unwrap_or_else(|_| format!("reseller-ap@{}", domain_of(&ap_email_address)));

        let mail_webhook_url = env::var("MAIL_WEBHOOK_URL").unwrap_or_default();
        let graph_client_state = env::var("GRAPH_CLIENT_STATE")
            .map_err(|_| "GRAPH_CLIENT_STATE must be set".to_string())?;

        let graph_api_base_url = env::var("GRAPH_API_BASE_URL")
            .unwrap_or_else(|_| "https://graph.microsoft.com/v1.0".to_string());
        let graph_bearer_token =
            env::var("GRAPH_BEARER_TOKEN").map_err(|_| "GRAPH_BEARER_TOKEN must be set".to_string())?;

        let chat_webhook_url =
            env::var("CHAT_WEBHOOK_URL").map_err(|_| "CHAT_WEBHOOK_URL must be set".to_string())?;

        let blob_store_root =
            env::var("BLOB_STORE_ROOT").unwrap_or_else(|_| "./blob-storage".to_string());

        let vendor_fuzzy_threshold: u8 = env::var("VENDOR_FUZZY_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(85);

        let rate_limit_disabled = env::var("RATE_LIMIT_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let rate_limit_per_minute: u32 = env::var("RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let mail_ingest_enabled = env::var("MAIL_INGEST_ENABLED")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        let poll_interval_secs: u64 = env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);
        let poll_page_size: u32 = env::var("POLL_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let llm_endpoint = env::var("LLM_ENDPOINT").ok();
        let llm_api_key = env::var("LLM_API_KEY").ok();
        let pdf_pre_extraction_enabled = env::var("PDF_PRE_EXTRACTION_ENABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let function_app_url = env::var("FUNCTION_APP_URL").unwrap_or_default();

        let dedup_window_days: i64 = env::var("DEDUP_WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(90);
        // Whether a same-invoice-different-id hit should block delivery
        // or only annotate it is configurable. Default to annotate-only
        // (do not block); an operator who wants the stricter behavior
        // opts in explicitly. See DESIGN.md for the reasoning.
        let candidate_dup_blocks = env::var("CANDIDATE_DUP_BLOCKS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let dead_letter_threshold: i32 = env::var("QUEUE_DEAD_LETTER_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        let visibility_timeout_secs: u64 = env::var("QUEUE_VISIBILITY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        let retry_base_delay_ms: u64 = env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);
        let retry_factor: u32 = env::var("RETRY_FACTOR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        let retry_cap_secs: u64 = env::var("RETRY_CAP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let retry_max_attempts: u32 = env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let breaker_failure_threshold: u32 = env::var("BREAKER_FAILURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let breaker_open_secs: u64 = env::var("BREAKER_OPEN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let subscription_renew_window_hours: u64 = env::var("SUBSCRIPTION_RENEW_WINDOW_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(48);
        let subscription_check_interval_days: u64 = env::var("SUBSCRIPTION_CHECK_INTERVAL_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(6);

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            host,
            port,
            ingest_mailbox,
            ap_email_address,
            allowed_ap_emails,
            vendor_registration_mailbox,
            reseller_mailbox,
            mail_webhook_url,
            graph_client_state,
            chat_webhook_url,
            vendor_fuzzy_threshold,
            rate_limit_disabled,
            rate_limit_per_minute,
            mail_ingest_enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            poll_page_size,
            llm_endpoint,
            llm_api_key,
            pdf_pre_extraction_enabled,
            function_app_url,
            dedup_window_days,
            candidate_dup_blocks,
            dead_letter_threshold,
            visibility_timeout: Duration::from_secs(visibility_timeout_secs),
            retry_base_delay: Duration::from_millis(retry_base_delay_ms),
            retry_factor,
            retry_cap: Duration::from_secs(retry_cap_secs),
            retry_max_attempts,
            breaker_failure_threshold,
            breaker_open_duration: Duration::from_secs(breaker_open_secs),
            subscription_renew_window: Duration::from_secs(subscription_renew_window_hours * 3600),
            subscription_check_interval: Duration::from_secs(
                subscription_check_interval_days * 86400,
            ),
        })
    }

    /// True if `recipient` is safe to send to (never the ingest mailbox).
    pub fn is_safe_recipient(&self, recipient: &str) -> bool {
        !recipient.eq_ignore_ascii_case(&self.ingest_mailbox)
    }

    /// True if `recipient` is one of the system-routed mailboxes (the
    /// default AP inbox, the vendor-registration mailbox, or the
    /// reseller mailbox) or, when `ALLOWED_AP_EMAILS` is non-empty, is
    /// present on that allowlist. An empty allowlist means "no
    /// restriction beyond the system mailboxes".
    pub fn is_allowed_recipient(&self, recipient: &str) -> bool {
        let is_system_mailbox = recipient.eq_ignore_ascii_case(&self.ap_email_address)
            || recipient.eq_ignore_ascii_case(&self.vendor_registration_mailbox)
            || recipient.eq_ignore_ascii_case(&self.reseller_mailbox);

        if is_system_mailbox {
            return true;
        }

        if self.allowed_ap_emails.is_empty() {
            return true;
        }

        self.allowed_ap_emails
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(recipient))
    }
}

fn domain_of(email: &str) -> &str {
    email.split('@').nth(1).unwrap_or("example.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ap_address_matching_ingest_mailbox() {
        // from_env reads real env vars; exercise the guard directly instead.
        let ingest = "invoices@acme.com";
        let ap = "INVOICES@acme.com";
        assert!(ap.eq_ignore_ascii_case(ingest));
    }

    #[test]
    fn domain_of_extracts_host_part() {
        assert_eq!(domain_of("billing@acme.com"), "acme.com");
        assert_eq!(domain_of("no-domain"), "example.com");
    }

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            bus_type: "inmemory".to_string(),
            nats_url: String::new(),
            host: "0.0.0.0".to_string(),
            port: 8090,
            ingest_mailbox: "invoices@acme.com".to_string(),
            ap_email_address: "ap@acme.com".to_string(),
            allowed_ap_emails: vec![],
            vendor_registration_mailbox: "vendor-registration@acme.com".to_string(),
            reseller_mailbox: "reseller-ap@acme.com".to_string(),
            mail_webhook_url: String::new(),
            graph_client_state: "secret".to_string(),
            chat_webhook_url: String::new(),
            vendor_fuzzy_threshold: 85,
            rate_limit_disabled: false,
            rate_limit_per_minute: 10,
            mail_ingest_enabled: true,
            poll_interval: Duration::from_secs(3600),
            poll_page_size: 50,
            llm_endpoint: None,
            llm_api_key: None,
            pdf_pre_extraction_enabled: false,
            function_app_url: String::new(),
            dedup_window_days: 90,
            candidate_dup_blocks: false,
            dead_letter_threshold: 3,
            visibility_timeout: Duration::from_secs(300),
            retry_base_delay: Duration::from_millis(500),
            retry_factor: 2,
            retry_cap: Duration::from_secs(30),
            retry_max_attempts: 5,
            breaker_failure_threshold: 5,
            breaker_open_duration: Duration::from_secs(60),
            subscription_renew_window: Duration::from_secs(48 * 3600),
            subscription_check_interval: Duration::from_secs(6 * 86400),
        }
    }

    #[test]
    fn allows_system_mailboxes_with_empty_allowlist() {
        let config = test_config();
        assert!(config.is_allowed_recipient("ap@acme.com"));
        assert!(config.is_allowed_recipient("vendor-registration@acme.com"));
    }

    #[test]
    fn empty_allowlist_permits_any_non_system_recipient() {
        let config = test_config();
        assert!(config.is_allowed_recipient("someone-else@acme.com"));
    }

    #[test]
    fn non_empty_allowlist_restricts_non_system_recipients() {
        let mut config = test_config();
        config.allowed_ap_emails = vec!["billing-override@acme.com".to_string()];
        assert!(config.is_allowed_recipient("billing-override@acme.com"));
        assert!(config.is_allowed_recipient("ap@acme.com"));
        assert!(!config.is_allowed_recipient("random@acme.com"));
    }
}
