mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;

pub use availability::{day_window, local_instant, merge_overlapping, overlaps_any, slot_candidates};
pub use error::EngineError;
pub use ledger::{LedgerCell, ProfessionalLedger};
pub use queries::{weekday_of, DEFAULT_GRANULARITY_MINUTES};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::ChangeNotifier;
use crate::wal::Wal;

use conflict::now_ms;
use ledger::apply_to_ledger;

pub type SharedLedger = Arc<LedgerCell>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// one fsync for the whole batch and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

/// One write and one fsync for the whole batch. On failure the WAL rolls
/// back to its previous length, so no caller's event survives a restart.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event), now_ms())
        .map(|_| ())
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events, now_ms()));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// The scheduling core: calendar rules, directories and the appointment ledger.
pub struct Engine {
    /// Calendar Rules Store.
    pub(super) clinics: DashMap<Ulid, ClinicSchedule>,
    pub(super) professionals: DashMap<Ulid, Professional>,
    pub(super) patients: DashMap<Ulid, Patient>,
    pub(super) appointment_types: DashMap<Ulid, AppointmentType>,
    /// Appointment Ledger, one cell per professional.
    pub(super) ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: appointment id → professional id.
    pub(super) appointment_index: DashMap<Ulid, Ulid>,
    /// Serializes calendar and directory writes so WAL order matches apply order.
    pub(super) admin: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<dyn ChangeNotifier>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<dyn ChangeNotifier>) -> io::Result<Self> {
        let (wal, replay) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            clinics: DashMap::new(),
            professionals: DashMap::new(),
            patients: DashMap::new(),
            appointment_types: DashMap::new(),
            ledgers: DashMap::new(),
            appointment_index: DashMap::new(),
            admin: Mutex::new(()),
            wal_tx,
            notify,
        };

        for event in replay.events() {
            engine.replay_event(event);
        }
        info!(
            "{}: replayed {} events ({} clinics, {} professionals, {} appointments)",
            wal_path.display(),
            replay.records.len(),
            engine.clinics.len(),
            engine.professionals.len(),
            engine.appointment_index.len()
        );

        Ok(engine)
    }

    /// Rebuild state from one logged event. We are the sole owner of every
    /// ledger during replay, so `try_write` never contends; never use
    /// `blocking_write` here since this may run inside a runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::AppointmentBooked(Appointment { professional_id, .. })
            | Event::AppointmentStatusChanged { professional_id, .. } => {
                let cell = self.ledger_for(*professional_id);
                match cell.state.try_write() {
                    Ok(mut guard) => apply_to_ledger(&mut guard, event, &self.appointment_index),
                    Err(_) => tracing::error!("replay: ledger {professional_id} unexpectedly locked"),
                }
            }
            other => self.apply_admin(other),
        }
    }

    /// Apply a calendar or directory event (caller holds `admin` or is replaying).
    pub(super) fn apply_admin(&self, event: &Event) {
        match event {
            Event::ClinicCreated { id, name, timezone } => {
                let tz = timezone.parse().unwrap_or(chrono_tz::Tz::UTC);
                self.clinics
                    .insert(*id, ClinicSchedule::new(*id, name.clone(), tz));
            }
            Event::HoursAdded { clinic_id, hours } => {
                if let Some(mut clinic) = self.clinics.get_mut(clinic_id) {
                    clinic.insert_hours(*hours);
                }
            }
            Event::HoursCleared { clinic_id, weekday } => {
                if let Some(mut clinic) = self.clinics.get_mut(clinic_id) {
                    clinic.clear_hours(*weekday);
                }
            }
            Event::ClosureAdded { clinic_id, date } => {
                if let Some(mut clinic) = self.clinics.get_mut(clinic_id) {
                    clinic.closures.insert(*date);
                }
            }
            Event::ClosureRemoved { clinic_id, date } => {
                if let Some(mut clinic) = self.clinics.get_mut(clinic_id) {
                    clinic.closures.remove(date);
                }
            }
            Event::ProfessionalSaved(p) => {
                self.ledger_for(p.id);
                self.professionals.insert(p.id, p.clone());
            }
            Event::PatientSaved(p) => {
                self.patients.insert(p.id, p.clone());
            }
            Event::AppointmentTypeSaved(t) => {
                self.appointment_types.insert(t.id, t.clone());
            }
            Event::AppointmentBooked(_) | Event::AppointmentStatusChanged { .. } => {}
        }
    }

    /// Write an event through the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(format!("WAL write failed: {e}")))
    }

    /// The professional's ledger cell, created on first use.
    pub(super) fn ledger_for(&self, professional_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(professional_id)
            .or_insert_with(|| Arc::new(LedgerCell::new(professional_id)))
            .value()
            .clone()
    }

    pub(super) fn existing_ledger(&self, professional_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(professional_id).map(|e| e.value().clone())
    }
}
