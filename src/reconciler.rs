//! One fetch-compare-notify-persist pass for a single shipment.

use tracing::{debug, error, info, warn};

use crate::fingerprint::fingerprint;
use crate::ledger::ShipmentLedger;
use crate::models::Shipment;
use crate::notification::{NotificationSink, build_notification, is_delivered};
use crate::strategy::{FetchFailure, FetchStrategy};

/// What a reconcile pass did for one shipment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Fetch failed; the shipment is retried on the next run.
    Deferred(FetchFailure),
    /// Carrier status matches the stored fingerprint.
    Unchanged,
    /// A notification went out. `persisted` is false if the ledger write failed.
    Notified { delivered: bool, persisted: bool },
    /// Status changed but nobody can be told; left for the next run.
    NoRecipient,
}

pub struct Reconciler<'a> {
    ledger: &'a ShipmentLedger,
    notifier: &'a dyn NotificationSink,
    default_recipient: Option<&'a str>,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ledger: &'a ShipmentLedger,
        notifier: &'a dyn NotificationSink,
        default_recipient: Option<&'a str>,
    ) -> Self {
        Self {
            ledger,
            notifier,
            default_recipient,
        }
    }

    pub async fn reconcile(
        &self,
        shipment: &Shipment,
        strategy: &dyn FetchStrategy,
    ) -> ReconcileOutcome {
        let waybill = shipment.waybill.as_str();

        let event = match strategy.fetch(waybill).await {
            Ok(event) => event,
            Err(failure) => {
                warn!(waybill, courier = %shipment.courier, %failure, "fetch failed, deferring");
                return ReconcileOutcome::Deferred(failure);
            }
        };

        let current = fingerprint(&event);
        if shipment.last_fingerprint.as_deref() == Some(current.as_str()) {
            debug!(waybill, "no status change");
            return ReconcileOutcome::Unchanged;
        }

        let recipient = Some(shipment.recipient.as_str())
            .filter(|r| !r.is_empty())
            .or(self.default_recipient);
        let Some(recipient) = recipient else {
            warn!(waybill, "status changed but shipment has no recipient");
            return ReconcileOutcome::NoRecipient;
        };

        let delivered = is_delivered(&event.details);
        info!(waybill, details = %event.details, location = %event.location, delivered, "status changed");

        let notification = build_notification(recipient, waybill, &event, delivered);
        self.notifier.send(&notification).await;

        let persisted = match self.ledger.record_transition(waybill, &current, delivered).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(waybill, error = %e, "notification sent but ledger write failed; expect a duplicate next run");
                false
            }
        };

        ReconcileOutcome::Notified {
            delivered,
            persisted,
        }
    }
}
