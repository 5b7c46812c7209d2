//! Delivery outcomes and how the scheduler reacts to them

use super::render::RenderError;
use thiserror::Error;

/// Why a delivery attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Sender rejected: {0}")]
    SenderRejected(String),

    #[error("Recipient rejected: {0}")]
    RecipientRejected(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Missing attachment: {0}")]
    MissingAttachment(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Account unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// What to do after a delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomePolicy {
    /// Pending -> Succeeded and count the delivery
    Succeeded,
    /// Disable the account and abandon its share of the campaign
    SuspendAccount,
    /// Pending -> Failed for this recipient only
    SkipRecipient,
    /// Same as `SkipRecipient`, and tell operators if it keeps happening
    SkipAndEscalate,
    /// Leave the recipient pending and stop using the account this pass
    AbortAccountShare,
}

impl DeliveryError {
    pub fn policy(&self) -> OutcomePolicy {
        match self {
            DeliveryError::Authentication(_) | DeliveryError::SenderRejected(_) => {
                OutcomePolicy::SuspendAccount
            }
            DeliveryError::RecipientRejected(_)
            | DeliveryError::MalformedHeader(_)
            | DeliveryError::MissingAttachment(_)
            | DeliveryError::MessageRejected(_) => OutcomePolicy::SkipRecipient,
            DeliveryError::Unavailable(_) => OutcomePolicy::AbortAccountShare,
            DeliveryError::Unexpected(_) => OutcomePolicy::SkipAndEscalate,
        }
    }
}

impl From<RenderError> for DeliveryError {
    fn from(err: RenderError) -> Self {
        DeliveryError::MissingAttachment(err.to_string())
    }
}

/// Map a delivery result to the policy the scheduler applies
pub fn classify(result: &Result<(), DeliveryError>) -> OutcomePolicy {
    match result {
        Ok(()) => OutcomePolicy::Succeeded,
        Err(err) => err.policy(),
    }
}

/// Counts unclassified failures within one campaign pass
#[derive(Debug, Clone)]
pub struct EscalationCounter {
    threshold: u32,
    count: u32,
    escalated: bool,
}

impl EscalationCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
            escalated: false,
        }
    }

    /// Record one failure; true exactly once, when the threshold is reached
    pub fn record(&mut self) -> bool {
        self.count += 1;
        if self.escalated || self.count < self.threshold {
            return false;
        }
        self.escalated = true;
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table() {
        let cases = [
            (Ok(()), OutcomePolicy::Succeeded),
            (Err(DeliveryError::Authentication("535".into())), OutcomePolicy::SuspendAccount),
            (Err(DeliveryError::SenderRejected("553".into())), OutcomePolicy::SuspendAccount),
            (Err(DeliveryError::RecipientRejected("550".into())), OutcomePolicy::SkipRecipient),
            (Err(DeliveryError::MalformedHeader("to".into())), OutcomePolicy::SkipRecipient),
            (Err(DeliveryError::MissingAttachment("logo".into())), OutcomePolicy::SkipRecipient),
            (Err(DeliveryError::MessageRejected("554".into())), OutcomePolicy::SkipRecipient),
            (Err(DeliveryError::Unavailable("421".into())), OutcomePolicy::AbortAccountShare),
            (Err(DeliveryError::Unexpected("?".into())), OutcomePolicy::SkipAndEscalate),
        ];
        for (result, expected) in cases {
            assert_eq!(classify(&result), expected, "{:?}", result);
        }
    }

    #[test]
    fn test_render_errors_are_missing_attachments() {
        let err: DeliveryError = RenderError::MessageNotFound(7).into();
        assert_eq!(err.policy(), OutcomePolicy::SkipRecipient);
        assert!(matches!(err, DeliveryError::MissingAttachment(_)));
    }

    #[test]
    fn test_escalation_fires_once() {
        let mut counter = EscalationCounter::new(3);
        let fired: Vec<bool> = (0..5).map(|_| counter.record()).collect();
        assert_eq!(fired, vec![false, false, true, false, false]);
        assert_eq!(counter.count(), 5);
    }
}
