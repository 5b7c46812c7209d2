//! Transport - Hands rendered messages to the sending account's SMTP relay

use super::outcome::DeliveryError;
use super::render::RenderedEmail;
use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    message::{
        header::{ContentType, Header, HeaderName, HeaderValue},
        Attachment, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailout_storage::{Recipient, SendingAccount};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// One outgoing message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub to_address: String,
    pub to_name: String,
    pub email: RenderedEmail,
    /// Value for the `List-Unsubscribe` header
    pub unsubscribe_url: Option<String>,
}

impl Envelope {
    pub fn new(recipient: &Recipient, email: RenderedEmail, unsubscribe_url: Option<String>) -> Self {
        Self {
            to_address: recipient.email().to_string(),
            to_name: recipient.full_name(),
            email,
            unsubscribe_url,
        }
    }
}

/// Delivers a message through a sending account
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, account: &SendingAccount, envelope: &Envelope) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim_matches(|c| c == '<' || c == '>').to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), format!("<{}>", self.0))
    }
}

/// Build the MIME message for an account and envelope
pub fn build_message(account: &SendingAccount, envelope: &Envelope) -> Result<Message, DeliveryError> {
    let from_address: Address = account
        .from_address
        .parse()
        .map_err(|e| DeliveryError::SenderRejected(format!("Invalid from address: {}", e)))?;
    let to_address: Address = envelope
        .to_address
        .parse()
        .map_err(|e| DeliveryError::RecipientRejected(format!("Invalid to address: {}", e)))?;

    let from = Mailbox::new(account.from_name.clone(), from_address);
    let to_name = Some(envelope.to_name.clone()).filter(|name| !name.is_empty());
    let to = Mailbox::new(to_name, to_address);

    let domain = account
        .from_address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("localhost");
    let message_id = format!("<{}.{}@{}>", Uuid::new_v4(), Utc::now().timestamp(), domain);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(envelope.email.subject.clone())
        .message_id(Some(message_id));
    if let Some(url) = &envelope.unsubscribe_url {
        builder = builder.header(ListUnsubscribe(url.clone()));
    }

    let email = &envelope.email;
    let html = if email.inline_assets.is_empty() {
        MultiPart::alternative()
            .singlepart(SinglePart::plain(email.plain_body.clone()))
            .singlepart(SinglePart::html(email.html_body.clone()))
    } else {
        let mut related = MultiPart::related().singlepart(SinglePart::html(email.html_body.clone()));
        for asset in &email.inline_assets {
            let content_type = ContentType::parse(&asset.content_type).map_err(|e| {
                DeliveryError::MalformedHeader(format!(
                    "Content type {} of {}: {}",
                    asset.content_type, asset.content_id, e
                ))
            })?;
            related = related.singlepart(
                Attachment::new_inline(asset.content_id.clone()).body(asset.data.clone(), content_type),
            );
        }
        MultiPart::alternative()
            .singlepart(SinglePart::plain(email.plain_body.clone()))
            .multipart(related)
    };

    builder
        .multipart(html)
        .map_err(|e| DeliveryError::MalformedHeader(format!("Failed to build email: {}", e)))
}

/// Map an SMTP reply code and text onto a delivery error
pub fn classify_reply(code: u16, text: &str) -> DeliveryError {
    let detail = format!("{} {}", code, text);
    match code {
        530 | 534 | 535 | 538 => DeliveryError::Authentication(detail),
        553 | 555 => DeliveryError::SenderRejected(detail),
        550 | 551 | 552 if text.to_ascii_lowercase().contains("sender") => {
            DeliveryError::SenderRejected(detail)
        }
        550 | 551 | 552 => DeliveryError::RecipientRejected(detail),
        501 | 554 => DeliveryError::MessageRejected(detail),
        400..=499 => DeliveryError::Unavailable(detail),
        _ => DeliveryError::Unexpected(detail),
    }
}

fn classify_smtp_error(err: &lettre::transport::smtp::Error) -> DeliveryError {
    if let Some(code) = err.status() {
        if let Ok(code) = code.to_string().parse::<u16>() {
            return classify_reply(code, &err.to_string());
        }
    }
    if err.is_timeout() || err.is_transient() {
        return DeliveryError::Unavailable(err.to_string());
    }
    if err.is_tls() || err.is_client() {
        return DeliveryError::Unavailable(err.to_string());
    }
    DeliveryError::Unexpected(err.to_string())
}

/// SMTP transport using each account's own relay and credentials
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    timeout: Duration,
}

impl Default for SmtpTransport {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl SmtpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn mailer(&self, account: &SendingAccount) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let builder = if account.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&account.smtp_host)
        } else if account.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.smtp_host)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.smtp_host))
        };
        let mut builder = builder
            .map_err(|e| DeliveryError::Unavailable(format!("Failed to create SMTP transport: {}", e)))?
            .port(account.smtp_port)
            .timeout(Some(self.timeout));

        if let (Some(username), Some(password)) = (&account.smtp_username, &account.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn deliver(&self, account: &SendingAccount, envelope: &Envelope) -> Result<(), DeliveryError> {
        let message = build_message(account, envelope)?;
        let mailer = self.mailer(account)?;

        match mailer.send(message).await {
            Ok(response) => {
                debug!(
                    account_id = account.id,
                    to = %envelope.to_address,
                    code = %response.code(),
                    "Message accepted by relay"
                );
                Ok(())
            }
            Err(e) => {
                let err = classify_smtp_error(&e);
                warn!(account_id = account.id, to = %envelope.to_address, error = %err, "Delivery failed");
                Err(err)
            }
        }
    }
}
