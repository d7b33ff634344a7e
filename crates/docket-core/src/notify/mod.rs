//! Batch completion notifications.
//!
//! The [`BatchNotifier`] claims a batch once all of its documents are
//! terminal, builds an [`ExportArtifact`] and hands a [`Notification`] to a
//! [`Mailer`]. Actual mail delivery lives behind the trait.

mod export;
mod notifier;

pub use export::{ExportArtifact, ExportEntry};
pub use notifier::BatchNotifier;

use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::{Error, Result};

/// Attachment carried by a notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub content: String,
}

/// A composed message ready for delivery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            to = %notification.to,
            subject = %notification.subject,
            attachments = notification.attachments.len(),
            "Notification (not delivered)"
        );
        Ok(())
    }
}

/// Posts the notification as JSON to a mail relay.
pub struct WebhookMailer {
    http: Client,
    url: Url,
}

impl WebhookMailer {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            http: Client::new(),
            url,
        }
    }
}

#[async_trait::async_trait]
impl Mailer for WebhookMailer {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self
            .http
            .post(self.url.clone())
            .json(notification)
            .send()
            .await
            .map_err(|e| Error::Dispatch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Dispatch(format!("mail relay returned {status}")));
        }

        Ok(())
    }
}
