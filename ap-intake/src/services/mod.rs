pub mod blob_store;
pub mod chat_notifier;
pub mod llm_client;
pub mod mail_provider;
pub mod pdf_extractor;
pub mod rate_limiter;
pub mod vendor_matcher;
