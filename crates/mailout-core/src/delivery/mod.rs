//! Delivery - Rendering, transport and outcome classification

mod outcome;
mod render;
mod transport;

pub use outcome::{classify, DeliveryError, EscalationCounter, OutcomePolicy};
pub use render::{
    InlineAsset, RecipientContext, RenderError, RenderedEmail, Renderer, StoredMessageRenderer,
};
pub use transport::{build_message, classify_reply, Envelope, SmtpTransport, Transport};
