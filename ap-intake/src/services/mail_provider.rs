//! Mail/graph provider interface.
//!
//! The upstream mail provider is an external system; this module only
//! defines the interface the pipeline consumes and a `reqwest`-based implementation
//! against a Graph-shaped REST API. Every network call is wrapped by
//! the shared circuit breaker and retry policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::circuit_breaker::{BreakerError, CircuitBreakerRegistry};
use crate::retry::Retriable;

pub const PROVIDER_DEPENDENCY: &str = "mail_provider";
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MailItem {
    pub original_message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub has_invoice_attachment: bool,
    pub attachment_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned status {0}")]
    Status(u16),
    #[error("item not found")]
    NotFound,
}

impl Retriable for ProviderError {
    fn is_retriable(&self) -> bool {
        match self {
            ProviderError::Request(_) => true,
            ProviderError::Status(code) => *code == 429 || *code >= 500,
            ProviderError::NotFound => false,
        }
    }
}

impl Retriable for BreakerError<ProviderError> {
    fn is_retriable(&self) -> bool {
        match self {
            BreakerError::Open => false,
            BreakerError::Inner(e) => e.is_retriable(),
        }
    }
}

/// The subset of mail/graph provider operations the pipeline needs.
/// Kept narrow and by-id so the rest of the codebase never builds an
/// in-memory object graph of mail items.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_unread(
        &self,
        mailbox: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<MailItem>, Option<String>), ProviderError>;

    async fn get_item(&self, mailbox: &str, message_id: &str) -> Result<MailItem, ProviderError>;

    /// Find the id of the attachment most likely to be the invoice PDF
    /// (the first file attachment). Returns `None` when the item has
    /// no attachments, even if `has_invoice_attachment` was true at
    /// list time (the item may have changed between list and fetch).
    async fn find_invoice_attachment_id(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Option<String>, ProviderError>;

    async fn download_attachment(
        &self,
        mailbox: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    async fn mark_read(&self, mailbox: &str, message_id: &str) -> Result<(), ProviderError>;

    async fn send_mail(&self, request: &SendMailRequest<'_>) -> Result<(), ProviderError>;

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest<'_>,
    ) -> Result<SubscriptionReceipt, ProviderError>;

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        new_expiration_utc: DateTime<Utc>,
    ) -> Result<(), ProviderError>;
}

pub struct SendMailRequest<'a> {
    pub to: &'a str,
    pub subject: &'a str,
    pub body_text: &'a str,
    pub attachment_bytes: Option<&'a [u8]>,
    pub attachment_filename: Option<&'a str>,
}

pub struct CreateSubscriptionRequest<'a> {
    pub webhook_url: &'a str,
    pub client_state: &'a str,
    pub resource: &'a str,
    pub change_types: &'a [&'a str],
    pub expiration_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionReceipt {
    pub subscription_id: String,
    pub expiration_utc: DateTime<Utc>,
}

/// `reqwest`-based provider client. Holds its own HTTP client and base
/// URL/token; callers go through `CircuitBreakerRegistry::call` to wrap
/// every method — the client itself performs no retry or breaking, that
/// is applied uniformly at the call site (consumer workers).
pub struct GraphMailProvider {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl GraphMailProvider {
    pub fn new(base_url: String, bearer_token: String) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            bearer_token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ListMessagesResponse {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    #[serde(rename = "internetMessageId")]
    internet_message_id: String,
    #[serde(rename = "from")]
    from: GraphRecipient,
    subject: String,
    #[serde(rename = "receivedDateTime")]
    received_date_time: DateTime<Utc>,
    #[serde(rename = "hasAttachments")]
    has_attachments: bool,
}

#[derive(Debug, Deserialize)]
struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: GraphEmailAddress,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: String,
}

#[async_trait]
impl MailProvider for GraphMailProvider {
    async fn list_unread(
        &self,
        mailbox: &str,
        page_token: Option<&str>,
    ) -> Result<(Vec<MailItem>, Option<String>), ProviderError> {
        let url = page_token.map(str::to_string).unwrap_or_else(|| {
            format!(
                "{}/users/{}/mailFolders/Inbox/messages?$filter=isRead eq false",
                self.base_url, mailbox
            )
        });

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let parsed: ListMessagesResponse = response.json().await?;
        let items = parsed
            .value
            .into_iter()
            .map(|m| MailItem {
                original_message_id: m.internet_message_id,
                sender: m.from.email_address.address,
                subject: m.subject,
                received_at: m.received_date_time,
                has_invoice_attachment: m.has_attachments,
                attachment_id: None,
            })
            .collect();

        Ok((items, parsed.next_link))
    }

    async fn get_item(&self, mailbox: &str, message_id: &str) -> Result<MailItem, ProviderError> {
        let url = format!("{}/users/{}/messages/{}", self.base_url, mailbox, message_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound);
        }
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let m: GraphMessage = response.json().await?;
        Ok(MailItem {
            original_message_id: m.internet_message_id,
            sender: m.from.email_address.address,
            subject: m.subject,
            received_at: m.received_date_time,
            has_invoice_attachment: m.has_attachments,
            attachment_id: None,
        })
    }

    async fn find_invoice_attachment_id(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        let url = format!(
            "{}/users/{}/messages/{}/attachments?$select=id,name,contentType",
            self.base_url, mailbox, message_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        #[derive(Deserialize)]
        struct AttachmentsResponse {
            value: Vec<AttachmentMeta>,
        }
        #[derive(Deserialize)]
        struct AttachmentMeta {
            id: String,
        }

        let parsed: AttachmentsResponse = response.json().await?;
        Ok(parsed.value.into_iter().next().map(|a| a.id))
    }

    async fn download_attachment(
        &self,
        mailbox: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/users/{}/messages/{}/attachments/{}/$value",
            self.base_url, mailbox, message_id, attachment_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn mark_read(&self, mailbox: &str, message_id: &str) -> Result<(), ProviderError> {
        let url = format!("{}/users/{}/messages/{}", self.base_url, mailbox, message_id);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({ "isRead": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn send_mail(&self, request: &SendMailRequest<'_>) -> Result<(), ProviderError> {
        let url = format!("{}/me/sendMail", self.base_url);

        let mut attachments = serde_json::json!([]);
        if let (Some(bytes), Some(filename)) =
            (request.attachment_bytes, request.attachment_filename)
        {
            use base64::Engine;
            attachments = serde_json::json!([{
                "@odata.type": "#microsoft.graph.fileAttachment",
                "name": filename,
                "contentBytes": base64::engine::general_purpose::STANDARD.encode(bytes),
            }]);
        }

        let body = serde_json::json!({
            "message": {
                "subject": request.subject,
                "body": { "contentType": "Text", "content": request.body_text },
                "toRecipients": [{ "emailAddress": { "address": request.to } }],
                "attachments": attachments,
            }
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest<'_>,
    ) -> Result<SubscriptionReceipt, ProviderError> {
        let url = format!("{}/subscriptions", self.base_url);
        let body = serde_json::json!({
            "changeType": request.change_types.join(","),
            "notificationUrl": request.webhook_url,
            "resource": request.resource,
            "clientState": request.client_state,
            "expirationDateTime": request.expiration_utc.to_rfc3339(),
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        #[derive(Deserialize)]
        struct CreateResponse {
            id: String,
            #[serde(rename = "expirationDateTime")]
            expiration_date_time: DateTime<Utc>,
        }

        let parsed: CreateResponse = response.json().await?;
        Ok(SubscriptionReceipt {
            subscription_id: parsed.id,
            expiration_utc: parsed.expiration_date_time,
        })
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        new_expiration_utc: DateTime<Utc>,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/subscriptions/{}", self.base_url, subscription_id);
        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.bearer_token)
            .json(&serde_json::json!({
                "expirationDateTime": new_expiration_utc.to_rfc3339(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Wrap a provider call through the circuit breaker registered for
/// `PROVIDER_DEPENDENCY`.
pub async fn through_breaker<F, Fut, T>(
    registry: &CircuitBreakerRegistry,
    call: F,
) -> Result<T, BreakerError<ProviderError>>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    registry.call(PROVIDER_DEPENDENCY, call).await
}

/// Retry a provider call through the breaker with exponential backoff,
/// so a transient failure resolves within one queue dequeue instead of
/// relying on visibility-timeout redelivery. Each attempt re-checks the
/// breaker, so a breaker that opens mid-retry short-circuits the rest of
/// the attempt budget.
pub async fn call_with_retry<F, Fut, T>(
    registry: &CircuitBreakerRegistry,
    retry_config: &crate::retry::RetryConfig,
    context: &str,
    call: F,
) -> Result<T, BreakerError<ProviderError>>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    crate::retry::retry_with_backoff(|| through_breaker(registry, &call), retry_config, context).await
}
