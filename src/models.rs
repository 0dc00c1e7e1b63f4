use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Carrier class of a waybill; decides which fetch strategy tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CourierKind {
    /// Blue Dart: 11-digit waybills, plain HTML tracking document.
    Bluedart,
    /// Delhivery: 12 to 14-digit waybills, browser-rendered tracking page.
    Delhivery,
}

impl CourierKind {
    /// Value stored in the ledger's `courier` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            CourierKind::Bluedart => "BLUEDART",
            CourierKind::Delhivery => "DELHIVERY",
        }
    }

    /// Human readable carrier name used in notifications.
    pub fn display_name(&self) -> &'static str {
        match self {
            CourierKind::Bluedart => "Blue Dart",
            CourierKind::Delhivery => "Delhivery",
        }
    }

    /// Classifies a waybill by its digit count.
    pub fn from_waybill_len(len: usize) -> Option<Self> {
        match len {
            11 => Some(CourierKind::Bluedart),
            12..=14 => Some(CourierKind::Delhivery),
            _ => None,
        }
    }
}

impl fmt::Display for CourierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown courier: {0}")]
pub struct UnknownCourier(pub String);

impl FromStr for CourierKind {
    type Err = UnknownCourier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BLUEDART" => Ok(CourierKind::Bluedart),
            "DELHIVERY" => Ok(CourierKind::Delhivery),
            other => Err(UnknownCourier(other.to_string())),
        }
    }
}

/// One row of the shipment ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    pub waybill: String,
    pub courier: CourierKind,
    /// `None` until the first successful observation.
    pub last_fingerprint: Option<String>,
    pub delivered: bool,
    pub recipient: String,
    pub updated_at: DateTime<Utc>,
}

/// Latest carrier event for a waybill. Never persisted as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEvent {
    pub courier_name: String,
    pub location: String,
    pub details: String,
    pub date: String,
    pub time: String,
    pub link: String,
}

/// A waybill harvested from the mailbox, ready for the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedWaybill {
    pub waybill: String,
    pub courier: CourierKind,
    pub recipient: String,
}
