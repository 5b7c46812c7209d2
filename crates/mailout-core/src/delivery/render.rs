//! Message rendering - Personalizes a stored message for one recipient

use async_trait::async_trait;
use mailout_common::types::MessageRef;
use mailout_storage::{MailoutStore, MassMailMessage, Recipient};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Render failures; the scheduler treats all of them as a per-recipient skip
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Message {0} not found")]
    MessageNotFound(MessageRef),

    #[error("Inline asset {path} unreadable: {reason}")]
    MissingAsset { path: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] mailout_common::Error),
}

/// Values a message can be personalized with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientContext {
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    pub full_name: String,
    pub email: String,
    pub reference: String,
    pub unsubscribe_url: String,
}

impl RecipientContext {
    pub fn new(recipient: &Recipient, unsubscribe_url: String) -> Self {
        Self {
            first_name: recipient.first_name().to_string(),
            last_name: recipient.last_name().to_string(),
            company_name: recipient.company_name().to_string(),
            full_name: recipient.full_name(),
            email: recipient.email().to_string(),
            reference: recipient.absolute_reference(),
            unsubscribe_url,
        }
    }

    fn fields(&self) -> [(&'static str, &str); 7] {
        [
            ("first_name", self.first_name.as_str()),
            ("last_name", self.last_name.as_str()),
            ("company_name", self.company_name.as_str()),
            ("full_name", self.full_name.as_str()),
            ("email", self.email.as_str()),
            ("reference", self.reference.as_str()),
            ("unsubscribe_url", self.unsubscribe_url.as_str()),
        ]
    }
}

/// Inline asset embedded in the HTML part, referenced as `cid:<content_id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAsset {
    pub content_id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    pub inline_assets: Vec<InlineAsset>,
}

/// Produces the email for one recipient. Must be deterministic.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(
        &self,
        message: MessageRef,
        context: &RecipientContext,
    ) -> Result<RenderedEmail, RenderError>;
}

/// Renders `MassMailMessage`s from the store, substituting `{{placeholder}}`s
pub struct StoredMessageRenderer {
    store: Arc<dyn MailoutStore>,
    asset_root: Option<PathBuf>,
    placeholder: Regex,
}

impl StoredMessageRenderer {
    pub fn new(store: Arc<dyn MailoutStore>) -> mailout_common::Result<Self> {
        let placeholder = Regex::new(r"\{\{\s*([^}]+?)\s*\}\}")
            .map_err(|e| mailout_common::Error::Internal(format!("Placeholder pattern: {}", e)))?;
        Ok(Self {
            store,
            asset_root: None,
            placeholder,
        })
    }

    /// Resolve relative asset paths against `root`
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = Some(root.into());
        self
    }

    /// Substitute known placeholders and drop unknown ones
    ///
    /// Only the template is scanned; substituted values are copied verbatim.
    pub fn substitute(&self, template: &str, context: &RecipientContext) -> String {
        let fields = context.fields();
        self.placeholder
            .replace_all(template, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                fields
                    .iter()
                    .find(|(field, _)| *field == name)
                    .map(|(_, value)| value.to_string())
                    .unwrap_or_default()
            })
            .into_owned()
    }

    async fn load_assets(&self, message: &MassMailMessage) -> Result<Vec<InlineAsset>, RenderError> {
        let mut assets = Vec::with_capacity(message.inline_assets.len());
        for asset in &message.inline_assets {
            let path = match &self.asset_root {
                Some(root) => root.join(&asset.path),
                None => PathBuf::from(&asset.path),
            };
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| RenderError::MissingAsset {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            assets.push(InlineAsset {
                content_id: asset.content_id.clone(),
                content_type: asset.content_type.clone(),
                data,
            });
        }
        Ok(assets)
    }
}

#[async_trait]
impl Renderer for StoredMessageRenderer {
    async fn render(
        &self,
        message_ref: MessageRef,
        context: &RecipientContext,
    ) -> Result<RenderedEmail, RenderError> {
        let message = self
            .store
            .get_message(message_ref)
            .await?
            .ok_or(RenderError::MessageNotFound(message_ref))?;

        let inline_assets = self.load_assets(&message).await?;
        debug!(
            message_ref,
            assets = inline_assets.len(),
            email = %context.email,
            "Message rendered"
        );

        Ok(RenderedEmail {
            subject: self.substitute(&message.subject, context),
            html_body: self.substitute(&message.html_body, context),
            plain_body: self.substitute(&message.plain_body, context),
            inline_assets,
        })
    }
}
