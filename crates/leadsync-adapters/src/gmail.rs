//! Gmail run-summary notification.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use leadsync_core::DeliveryStatus;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::TokenProvider;
use crate::http::ApiClient;
use crate::{AdapterError, Notifier};

const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com";

#[derive(Debug, Clone)]
pub struct GmailSettings {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
}

pub fn notification_body(success_count: usize, failed_count: usize, report_url: &str) -> String {
    format!(
        "Hello,\n\n\
         Please find the upload report details below:\n\
         Successful Uploads: {success_count}\n\
         Failed Uploads: {failed_count}\n\
         Report URL: {report_url}\n\n\
         Best regards,\n\
         Your Pipeline Service"
    )
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn encode_subject(subject: &str) -> String {
    let subject = header_value(subject);
    if subject.is_ascii() {
        subject
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
    }
}

/// Single-part `text/plain` RFC 5322 message.
pub fn build_mime_message(sender: &str, to: &str, subject: &str, body: &str) -> String {
    format!(
        "To: {}\r\nFrom: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=\"utf-8\"\r\n\
         Content-Transfer-Encoding: 8bit\r\n\r\n{}",
        header_value(to),
        header_value(sender),
        encode_subject(subject),
        body.replace("\r\n", "\n").replace('\n', "\r\n"),
    )
}

pub fn encode_raw(message: &str) -> String {
    URL_SAFE.encode(message.as_bytes())
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

pub struct GmailNotifier {
    http: ApiClient,
    tokens: Arc<dyn TokenProvider>,
    settings: GmailSettings,
    base_url: String,
}

impl GmailNotifier {
    pub fn new(http: ApiClient, tokens: Arc<dyn TokenProvider>, settings: GmailSettings) -> Self {
        Self {
            http,
            tokens,
            settings,
            base_url: GMAIL_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Notifier for GmailNotifier {
    async fn send_summary(
        &self,
        success_count: usize,
        failed_count: usize,
        report_url: &str,
    ) -> Result<DeliveryStatus, AdapterError> {
        let message = build_mime_message(
            &self.settings.sender,
            &self.settings.recipient,
            &self.settings.subject,
            &notification_body(success_count, failed_count, report_url),
        );
        let token = self.tokens.bearer_token().await?;
        let request = self
            .http
            .inner()
            .post(format!(
                "{}/gmail/v1/users/me/messages/send",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&token.access_token)
            .json(&json!({"raw": encode_raw(&message)}));
        let sent: SentMessage = self.http.send_json("gmail send", request).await?;

        info!(message_id = %sent.id, recipient = %self.settings.recipient, "summary email sent");
        Ok(DeliveryStatus {
            status: "success".to_string(),
            message: format!("Email sent successfully, id: {}", sent.id),
        })
    }
}
