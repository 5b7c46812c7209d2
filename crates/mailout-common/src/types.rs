//! Common types for Mailout

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for CRM users (owners of accounts, recipients and campaigns)
pub type UserId = i64;

/// Unique identifier for sending accounts
pub type AccountId = i64;

/// Unique identifier for campaigns ("mailing outs")
pub type CampaignId = i64;

/// Unique identifier for recipients within their kind
pub type RecipientId = i64;

/// Opaque reference to the message a campaign sends
pub type MessageRef = i64;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Kind of CRM record a campaign targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Company,
    Contact,
    Lead,
}

impl std::fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientKind::Company => write!(f, "company"),
            RecipientKind::Contact => write!(f, "contact"),
            RecipientKind::Lead => write!(f, "lead"),
        }
    }
}

impl std::str::FromStr for RecipientKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(RecipientKind::Company),
            "contact" => Ok(RecipientKind::Contact),
            "lead" => Ok(RecipientKind::Lead),
            _ => Err(crate::Error::Validation(format!(
                "Invalid recipient kind: {}",
                s
            ))),
        }
    }
}

/// Key identifying one recipient record across kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientKey {
    pub kind: RecipientKind,
    pub id: RecipientId,
}

impl RecipientKey {
    pub fn new(kind: RecipientKind, id: RecipientId) -> Self {
        Self { kind, id }
    }

    pub fn company(id: RecipientId) -> Self {
        Self::new(RecipientKind::Company, id)
    }

    pub fn contact(id: RecipientId) -> Self {
        Self::new(RecipientKind::Contact, id)
    }

    pub fn lead(id: RecipientId) -> Self {
        Self::new(RecipientKind::Lead, id)
    }
}

impl std::fmt::Display for RecipientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Execution mode of the process
///
/// Pacing between deliveries only happens in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Production,
    Development,
    Test,
}

impl ExecutionMode {
    pub fn is_production(&self) -> bool {
        matches!(self, ExecutionMode::Production)
    }
}

/// Wall-clock time of day (hour and minute)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
}

impl ClockTime {
    pub const fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    /// Convert to a `NaiveTime`, rejecting out-of-range values
    pub fn to_naive(self) -> crate::Result<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).ok_or_else(|| {
            crate::Error::Config(format!(
                "Invalid time of day {:02}:{:02}",
                self.hour, self.minute
            ))
        })
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_kind_roundtrip() {
        for kind in [
            RecipientKind::Company,
            RecipientKind::Contact,
            RecipientKind::Lead,
        ] {
            assert_eq!(kind.to_string().parse::<RecipientKind>().unwrap(), kind);
        }
        assert!("deal".parse::<RecipientKind>().is_err());
    }

    #[test]
    fn test_recipient_key_display() {
        assert_eq!(RecipientKey::contact(42).to_string(), "contact:42");
    }

    #[test]
    fn test_clock_time() {
        let t = ClockTime::new(8, 30);
        assert_eq!(t.to_string(), "08:30");
        assert_eq!(t.to_naive().unwrap(), NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert!(ClockTime::new(25, 0).to_naive().is_err());
    }

    #[test]
    fn test_execution_mode() {
        assert!(ExecutionMode::default().is_production());
        assert!(!ExecutionMode::Test.is_production());
    }
}
