use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

/// One professional's calendar, across every clinic they work in.
#[derive(Debug, Clone)]
pub struct ProfessionalLedger {
    pub professional_id: Ulid,
    /// Every appointment ever booked, any status, sorted by `start`.
    pub appointments: Vec<Appointment>,
}

impl ProfessionalLedger {
    pub fn new(professional_id: Ulid) -> Self {
        Self {
            professional_id,
            appointments: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Appointments of any status whose span intersects `window`.
    /// Binary search skips everything starting at or after `window.end`.
    pub fn overlapping(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.start < window.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end() > window.start)
    }

    /// Scheduled, confirmed or completed appointments intersecting `window`, by start.
    pub fn active_in(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        self.overlapping(window).filter(|a| a.is_active())
    }

    /// First active appointment colliding with `span`, if any.
    pub fn find_conflict(&self, span: &Span) -> Option<Ulid> {
        self.active_in(span).map(|a| a.id).next()
    }

    /// Sorted insert. Only reached through `apply_to_ledger` once the
    /// coordinator has checked for conflicts under the exclusion scope.
    pub(super) fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.start, |a| a.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub(super) fn set_status(&mut self, id: Ulid, status: AppointmentStatus) -> bool {
        match self.appointments.iter_mut().find(|a| a.id == id) {
            Some(a) => {
                a.status = status;
                true
            }
            None => false,
        }
    }
}

/// A ledger plus the exclusion scope guarding writes to it.
///
/// Writers hold `scope` for re-validation + WAL append + apply. `state` is
/// write-locked only for the in-memory apply, so readers never wait on the
/// scope or on disk I/O.
#[derive(Debug)]
pub struct LedgerCell {
    pub scope: Mutex<()>,
    pub state: RwLock<ProfessionalLedger>,
}

impl LedgerCell {
    pub fn new(professional_id: Ulid) -> Self {
        Self {
            scope: Mutex::new(()),
            state: RwLock::new(ProfessionalLedger::new(professional_id)),
        }
    }
}

/// Apply a ledger event (no locking; caller holds the write lock).
pub(super) fn apply_to_ledger(
    ledger: &mut ProfessionalLedger,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::AppointmentBooked(appointment) => {
            index.insert(appointment.id, appointment.professional_id);
            ledger.insert(appointment.clone());
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            ledger.set_status(*id, *status);
        }
        _ => {}
    }
}
