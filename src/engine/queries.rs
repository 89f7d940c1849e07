use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{busy_window, merge_overlapping, slot_candidates};
use super::conflict::{validate_minutes, validate_window};
use super::{Engine, EngineError};

pub const DEFAULT_GRANULARITY_MINUTES: i64 = 30;

/// 0 = Sunday … 6 = Saturday.
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

impl Engine {
    // ── Availability ─────────────────────────────────────────

    /// Bookable start times for `professional_id` at `clinic_id` on the local `date`.
    ///
    /// Reads a snapshot of the clinic's rules and of the professional's active
    /// appointments for that local day, then walks the opening intervals in
    /// `granularity_minutes` steps. Every appointment of the professional counts,
    /// whichever clinic it was booked in.
    pub async fn compute_slots(
        &self,
        clinic_id: Ulid,
        professional_id: Ulid,
        date: NaiveDate,
        duration_minutes: i64,
        granularity_minutes: i64,
    ) -> Result<Vec<Slot>, EngineError> {
        let duration = validate_minutes(duration_minutes, MAX_DURATION_MINUTES, "duration")?;
        let granularity =
            validate_minutes(granularity_minutes, MAX_GRANULARITY_MINUTES, "granularity")?;

        let (tz, hours) = {
            let clinic = self
                .clinics
                .get(&clinic_id)
                .ok_or(EngineError::NotFound(clinic_id))?;
            let hours = if clinic.is_closed_on(date) {
                Vec::new()
            } else {
                clinic.hours_for(weekday_of(date)).to_vec()
            };
            (clinic.timezone, hours)
        };
        let active = self
            .professionals
            .get(&professional_id)
            .map(|p| p.active)
            .ok_or(EngineError::NotFound(professional_id))?;
        if !active || hours.is_empty() {
            return Ok(Vec::new());
        }

        let window = busy_window(date, tz, duration)
            .ok_or_else(|| EngineError::invalid(format!("date out of range: {date}")))?;
        let busy = match self.existing_ledger(&professional_id) {
            Some(cell) => {
                let ledger = cell.state.read().await;
                let spans: Vec<Span> = ledger.active_in(&window).map(|a| a.span()).collect();
                merge_overlapping(&spans)
            }
            None => Vec::new(),
        };

        Ok(slot_candidates(date, tz, &hours, &busy, duration, granularity).collect())
    }

    // ── Calendar rules ───────────────────────────────────────

    /// Intervals for one weekday, ordered by open time. Empty when closed.
    pub fn get_intervals(&self, clinic_id: Ulid, weekday: u8) -> Result<Vec<OpeningHours>, EngineError> {
        if weekday > 6 {
            return Err(EngineError::invalid(format!("weekday must be 0-6, got {weekday}")));
        }
        let clinic = self
            .clinics
            .get(&clinic_id)
            .ok_or(EngineError::NotFound(clinic_id))?;
        Ok(clinic.hours_for(weekday).to_vec())
    }

    /// Like [`Engine::get_intervals`] for the weekday of `date`, but empty on a closure date.
    pub fn intervals_on(&self, clinic_id: Ulid, date: NaiveDate) -> Result<Vec<OpeningHours>, EngineError> {
        let clinic = self
            .clinics
            .get(&clinic_id)
            .ok_or(EngineError::NotFound(clinic_id))?;
        if clinic.is_closed_on(date) {
            return Ok(Vec::new());
        }
        Ok(clinic.hours_for(weekday_of(date)).to_vec())
    }

    /// The whole week, ordered by `(weekday, open)`.
    pub fn clinic_hours(&self, clinic_id: Ulid) -> Result<Vec<OpeningHours>, EngineError> {
        self.clinics
            .get(&clinic_id)
            .map(|c| c.hours.clone())
            .ok_or(EngineError::NotFound(clinic_id))
    }

    pub fn get_clinic(&self, clinic_id: Ulid) -> Option<ClinicSchedule> {
        self.clinics.get(&clinic_id).map(|c| c.value().clone())
    }

    pub fn closures(&self, clinic_id: Ulid) -> Result<Vec<NaiveDate>, EngineError> {
        self.clinics
            .get(&clinic_id)
            .map(|c| c.closures.iter().copied().collect())
            .ok_or(EngineError::NotFound(clinic_id))
    }

    // ── Ledger ───────────────────────────────────────────────

    /// Scheduled, confirmed and completed appointments intersecting `[start, end)`.
    pub async fn list_active(
        &self,
        professional_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        let window = validate_window(start, end)?;
        let Some(cell) = self.existing_ledger(&professional_id) else {
            return Ok(Vec::new());
        };
        let ledger = cell.state.read().await;
        Ok(ledger.active_in(&window).cloned().collect())
    }

    /// Every appointment intersecting `[start, end)`, cancelled ones included.
    pub async fn appointments_for(
        &self,
        professional_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        let window = validate_window(start, end)?;
        let Some(cell) = self.existing_ledger(&professional_id) else {
            return Ok(Vec::new());
        };
        let ledger = cell.state.read().await;
        Ok(ledger.overlapping(&window).cloned().collect())
    }

    /// A professional's calendar as seen from `clinic_id`: appointments booked
    /// at other clinics are kept and flagged so the viewer sees why the time is taken.
    pub async fn calendar_view(
        &self,
        professional_id: Ulid,
        clinic_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        active_only: bool,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        let appointments = if active_only {
            self.list_active(professional_id, start, end).await?
        } else {
            self.appointments_for(professional_id, start, end).await?
        };
        Ok(appointments
            .into_iter()
            .map(|appointment| CalendarEntry {
                other_clinic: clinic_id.is_some_and(|c| c != appointment.clinic_id),
                appointment,
            })
            .collect())
    }

    pub async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        let professional_id = *self.appointment_index.get(&id)?.value();
        let cell = self.existing_ledger(&professional_id)?;
        let ledger = cell.state.read().await;
        ledger.get(id).cloned()
    }

    // ── Directories ──────────────────────────────────────────

    pub fn get_professional(&self, id: Ulid) -> Option<Professional> {
        self.professionals.get(&id).map(|p| p.value().clone())
    }

    /// Sorted by id.
    pub fn list_professionals(&self, active_only: bool) -> Vec<Professional> {
        let mut out: Vec<Professional> = self
            .professionals
            .iter()
            .filter(|p| !active_only || p.active)
            .map(|p| p.value().clone())
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    pub fn get_patient(&self, id: Ulid) -> Option<Patient> {
        self.patients.get(&id).map(|p| p.value().clone())
    }

    pub fn get_appointment_type(&self, id: Ulid) -> Option<AppointmentType> {
        self.appointment_types.get(&id).map(|t| t.value().clone())
    }
}
