//! The four ordered phases of one tracking run.

use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ingest::WaybillSource;
use crate::ledger::ShipmentLedger;
use crate::models::{CourierKind, Shipment};
use crate::notification::NotificationSink;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::strategy::{FetchStrategy, RenderSession, SessionProvider, SessionStrategy};

/// How the rendering-session phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// No shipments needed it; no session was started.
    #[default]
    Skipped,
    Completed,
    /// The session could not be acquired.
    Failed,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub ingested: usize,
    pub active: usize,
    pub notified: usize,
    pub unchanged: usize,
    pub deferred: usize,
    pub persist_failures: usize,
    pub session_phase: PhaseStatus,
}

impl RunReport {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Deferred(_) | ReconcileOutcome::NoRecipient => self.deferred += 1,
            ReconcileOutcome::Unchanged => self.unchanged += 1,
            ReconcileOutcome::Notified { persisted, .. } => {
                self.notified += 1;
                if !persisted {
                    self.persist_failures += 1;
                }
            }
        }
    }
}

/// Renders the report as one JSON object for the end-of-run log line.
impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

/// Per-run settings for the rendering-session phase and recipient fallback.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub session_url_template: String,
    pub session_timeout: Duration,
    pub default_recipient: Option<String>,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_url_template: config.delhivery_url_template.clone(),
            session_timeout: config.session_timeout,
            default_recipient: config.recipient_email.clone(),
        }
    }
}

pub struct Orchestrator {
    ledger: ShipmentLedger,
    source: Box<dyn WaybillSource>,
    notifier: Box<dyn NotificationSink>,
    document: Box<dyn FetchStrategy>,
    sessions: Box<dyn SessionProvider>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        ledger: ShipmentLedger,
        source: Box<dyn WaybillSource>,
        notifier: Box<dyn NotificationSink>,
        document: Box<dyn FetchStrategy>,
        sessions: Box<dyn SessionProvider>,
        settings: RunSettings,
    ) -> Self {
        Self {
            ledger,
            source,
            notifier,
            document,
            sessions,
            settings,
        }
    }

    pub fn ledger(&self) -> &ShipmentLedger {
        &self.ledger
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(
            &self.ledger,
            self.notifier.as_ref(),
            self.settings.default_recipient.as_deref(),
        )
    }

    /// Runs ingest, load, document phase and session phase, in that order.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport {
            ingested: self.ingest().await,
            ..RunReport::default()
        };

        let active = match self.ledger.list_active().await {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "failed to load active shipments");
                return report;
            }
        };
        report.active = active.len();
        info!(count = active.len(), "active shipments loaded");

        let (documents, sessions): (Vec<Shipment>, Vec<Shipment>) = active
            .into_iter()
            .partition(|s| s.courier == CourierKind::Bluedart);

        self.document_phase(&documents, &mut report).await;
        report.session_phase = self.session_phase(&sessions, &mut report).await;

        info!(%report, "run finished");
        report
    }

    async fn ingest(&self) -> usize {
        let batch = match self.source.drain().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "mailbox unavailable, continuing with known shipments");
                return 0;
            }
        };

        let mut stored = 0;
        for item in &batch {
            match self.ledger.upsert(&item.waybill, item.courier, &item.recipient).await {
                Ok(outcome) => {
                    info!(waybill = %item.waybill, courier = %item.courier, ?outcome, "waybill ingested");
                    stored += 1;
                }
                Err(e) => error!(waybill = %item.waybill, error = %e, "failed to store ingested waybill"),
            }
        }
        stored
    }

    async fn document_phase(&self, shipments: &[Shipment], report: &mut RunReport) {
        if shipments.is_empty() {
            debug!("no document-tracked shipments");
            return;
        }

        let reconciler = self.reconciler();
        for shipment in shipments {
            let outcome = reconciler.reconcile(shipment, self.document.as_ref()).await;
            report.record(&outcome);
        }
    }

    async fn session_phase(&self, shipments: &[Shipment], report: &mut RunReport) -> PhaseStatus {
        if shipments.is_empty() {
            debug!("no session-tracked shipments, not starting a browser");
            return PhaseStatus::Skipped;
        }

        let session = match self.sessions.acquire().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, pending = shipments.len(), "rendering session unavailable");
                report.deferred += shipments.len();
                return PhaseStatus::Failed;
            }
        };

        let batch = AssertUnwindSafe(self.session_batch(session.as_ref(), shipments, report))
            .catch_unwind()
            .await;

        self.sessions.release(session).await;
        debug!("rendering session released");

        if let Err(panic) = batch {
            resume_unwind(panic);
        }
        PhaseStatus::Completed
    }

    async fn session_batch(
        &self,
        session: &dyn RenderSession,
        shipments: &[Shipment],
        report: &mut RunReport,
    ) {
        let strategy = SessionStrategy::new(
            session,
            self.settings.session_url_template.clone(),
            self.settings.session_timeout,
        );
        let reconciler = self.reconciler();

        for shipment in shipments {
            let outcome = reconciler.reconcile(shipment, &strategy).await;
            report.record(&outcome);
        }
    }
}
