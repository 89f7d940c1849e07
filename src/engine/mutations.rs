use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, STATUS_CHANGES_TOTAL};

use super::conflict::{check_transition, now_ms, validate_booking};
use super::ledger::apply_to_ledger;
use super::{Engine, EngineError, WalCommand};

fn check_name(name: &Option<String>, what: &'static str) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn validate_hours(hours: &OpeningHours) -> Result<(), EngineError> {
    if hours.weekday > 6 {
        return Err(EngineError::invalid(format!(
            "weekday must be 0-6, got {}",
            hours.weekday
        )));
    }
    if hours.open >= hours.close {
        return Err(EngineError::invalid("open must be before close"));
    }
    if hours.close > MINUTES_PER_DAY {
        return Err(EngineError::invalid("close must be at most 24:00"));
    }
    Ok(())
}

fn validate_weekday(weekday: Option<u8>) -> Result<(), EngineError> {
    match weekday {
        Some(day) if day > 6 => Err(EngineError::invalid(format!("weekday must be 0-6, got {day}"))),
        _ => Ok(()),
    }
}

/// `#rrggbb`.
fn validate_color(color: &Option<String>) -> Result<(), EngineError> {
    let Some(c) = color else { return Ok(()) };
    if c.len() > MAX_COLOR_LEN {
        return Err(EngineError::LimitExceeded("color too long"));
    }
    let hex = c.strip_prefix('#').unwrap_or("");
    if hex.len() != 6 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(EngineError::invalid(format!("color must be #rrggbb, got {c:?}")));
    }
    Ok(())
}

impl Engine {
    // ── Calendar rules ───────────────────────────────────────

    pub async fn create_clinic(
        &self,
        id: Ulid,
        name: Option<String>,
        timezone: Option<&str>,
    ) -> Result<(), EngineError> {
        check_name(&name, "clinic name too long")?;
        let tz: Tz = match timezone {
            Some(tz) => tz
                .parse()
                .map_err(|_| EngineError::invalid(format!("unknown timezone: {tz}")))?,
            None => Tz::UTC,
        };

        let _admin = self.admin.lock().await;
        if self.clinics.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.clinics.len() >= MAX_CLINICS {
            return Err(EngineError::LimitExceeded("too many clinics"));
        }
        let event = Event::ClinicCreated {
            id,
            name,
            timezone: tz.name().to_string(),
        };
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        info!(clinic = %id, timezone = tz.name(), "clinic created");
        Ok(())
    }

    /// Add intervals to a clinic's weekly hours. Every interval is checked
    /// against the existing ones and against the rest of the batch before
    /// anything is written.
    pub async fn add_opening_hours(
        &self,
        clinic_id: Ulid,
        intervals: &[OpeningHours],
    ) -> Result<(), EngineError> {
        if intervals.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for h in intervals {
            validate_hours(h)?;
        }
        for (i, a) in intervals.iter().enumerate() {
            if let Some(b) = intervals[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(EngineError::invalid(format!(
                    "intervals {}-{} and {}-{} overlap on weekday {}",
                    a.open, a.close, b.open, b.close, a.weekday
                )));
            }
        }

        let _admin = self.admin.lock().await;
        {
            let clinic = self
                .clinics
                .get(&clinic_id)
                .ok_or(EngineError::NotFound(clinic_id))?;
            if clinic.hours.len() + intervals.len() > MAX_HOURS_PER_CLINIC {
                return Err(EngineError::LimitExceeded("too many opening hours"));
            }
            for h in intervals {
                if let Some(existing) = clinic.overlapping_hours(h) {
                    return Err(EngineError::invalid(format!(
                        "interval {}-{} overlaps existing {}-{} on weekday {}",
                        h.open, h.close, existing.open, existing.close, h.weekday
                    )));
                }
            }
        }

        for h in intervals {
            let event = Event::HoursAdded {
                clinic_id,
                hours: *h,
            };
            self.wal_append(&event).await?;
            self.apply_admin(&event);
        }
        debug!(clinic = %clinic_id, added = intervals.len(), "opening hours added");
        Ok(())
    }

    /// Remove one weekday's intervals, or every interval when `weekday` is `None`.
    pub async fn clear_opening_hours(
        &self,
        clinic_id: Ulid,
        weekday: Option<u8>,
    ) -> Result<(), EngineError> {
        validate_weekday(weekday)?;
        let _admin = self.admin.lock().await;
        if !self.clinics.contains_key(&clinic_id) {
            return Err(EngineError::NotFound(clinic_id));
        }
        let event = Event::HoursCleared { clinic_id, weekday };
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        Ok(())
    }

    pub async fn add_closure(&self, clinic_id: Ulid, date: NaiveDate) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        {
            let clinic = self
                .clinics
                .get(&clinic_id)
                .ok_or(EngineError::NotFound(clinic_id))?;
            if clinic.is_closed_on(date) {
                return Ok(());
            }
            if clinic.closures.len() >= MAX_CLOSURES_PER_CLINIC {
                return Err(EngineError::LimitExceeded("too many closures"));
            }
        }
        let event = Event::ClosureAdded { clinic_id, date };
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        Ok(())
    }

    /// Returns whether a closure was actually removed.
    pub async fn remove_closure(&self, clinic_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let _admin = self.admin.lock().await;
        let present = self
            .clinics
            .get(&clinic_id)
            .ok_or(EngineError::NotFound(clinic_id))?
            .is_closed_on(date);
        if !present {
            return Ok(false);
        }
        let event = Event::ClosureRemoved { clinic_id, date };
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        Ok(true)
    }

    // ── Directories ──────────────────────────────────────────

    /// Insert or replace a professional.
    pub async fn save_professional(&self, professional: Professional) -> Result<(), EngineError> {
        check_name(&professional.name, "professional name too long")?;
        let _admin = self.admin.lock().await;
        if !self.professionals.contains_key(&professional.id)
            && self.professionals.len() >= MAX_PROFESSIONALS
        {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        let event = Event::ProfessionalSaved(professional);
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        Ok(())
    }

    pub async fn save_patient(&self, patient: Patient) -> Result<(), EngineError> {
        check_name(&patient.name, "patient name too long")?;
        let _admin = self.admin.lock().await;
        let event = Event::PatientSaved(patient);
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        Ok(())
    }

    pub async fn save_appointment_type(
        &self,
        appointment_type: AppointmentType,
    ) -> Result<(), EngineError> {
        check_name(&appointment_type.name, "appointment type name too long")?;
        validate_color(&appointment_type.color)?;
        let _admin = self.admin.lock().await;
        let event = Event::AppointmentTypeSaved(appointment_type);
        self.wal_append(&event).await?;
        self.apply_admin(&event);
        Ok(())
    }

    // ── Booking coordinator ──────────────────────────────────

    /// Reserve `[start, start + duration)` for a professional.
    ///
    /// Input is validated before anything is locked. The overlap test is then
    /// re-run against the live ledger under the professional's exclusion
    /// scope, so of two concurrent overlapping requests exactly one commits.
    /// The critical section runs on its own task: dropping the returned
    /// future never leaves the WAL and the ledger out of step.
    pub async fn book(self: &Arc<Self>, req: BookingRequest) -> Result<Appointment, EngineError> {
        let now = now_ms();
        let duration_min = match validate_booking(&req, now) {
            Ok(d) => d,
            Err(e) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "invalid").increment(1);
                return Err(e);
            }
        };
        if !self.clinics.contains_key(&req.clinic_id) {
            return Err(EngineError::NotFound(req.clinic_id));
        }
        let active = self
            .professionals
            .get(&req.professional_id)
            .map(|p| p.active)
            .ok_or(EngineError::NotFound(req.professional_id))?;
        if !active {
            return Err(EngineError::invalid(format!(
                "professional {} is not active",
                req.professional_id
            )));
        }

        let appointment = Appointment {
            id: req.id.unwrap_or_else(Ulid::new),
            clinic_id: req.clinic_id,
            professional_id: req.professional_id,
            patient_id: req.patient_id,
            type_id: req.type_id,
            start: req.start,
            duration_min,
            status: AppointmentStatus::Scheduled,
            created_at: now,
        };

        let engine = Arc::clone(self);
        let result = tokio::spawn(async move { engine.commit_booking(appointment).await })
            .await
            .map_err(|e| EngineError::Unavailable(format!("booking task failed: {e}")))?;

        let outcome = match &result {
            Ok(_) => "booked",
            Err(EngineError::Conflict(_)) => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn commit_booking(&self, appointment: Appointment) -> Result<Appointment, EngineError> {
        let cell = self.ledger_for(appointment.professional_id);
        let scope = cell.scope.lock().await;

        if self.appointment_index.contains_key(&appointment.id) {
            return Err(EngineError::AlreadyExists(appointment.id));
        }
        {
            let ledger = cell.state.read().await;
            if ledger.len() >= MAX_APPOINTMENTS_PER_PROFESSIONAL {
                return Err(EngineError::LimitExceeded("too many appointments for professional"));
            }
            if let Some(existing) = ledger.find_conflict(&appointment.span()) {
                debug!(
                    professional = %appointment.professional_id,
                    conflicting = %existing,
                    "booking rejected"
                );
                return Err(EngineError::Conflict(existing));
            }
        }

        let event = Event::AppointmentBooked(appointment.clone());
        self.wal_append(&event).await?;
        {
            let mut ledger = cell.state.write().await;
            apply_to_ledger(&mut ledger, &event, &self.appointment_index);
        }
        drop(scope);

        self.notify
            .publish(&ChangeEvent::appointment(&appointment, ChangeType::Insert));
        info!(
            appointment = %appointment.id,
            professional = %appointment.professional_id,
            clinic = %appointment.clinic_id,
            start = appointment.start,
            duration = appointment.duration_min,
            "appointment booked"
        );
        Ok(appointment)
    }

    /// Move an appointment along its lifecycle. Terminal states accept nothing.
    pub async fn update_status(
        self: &Arc<Self>,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let professional_id = self
            .appointment_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;

        let engine = Arc::clone(self);
        let result = tokio::spawn(async move {
            engine.commit_status(id, professional_id, status).await
        })
        .await
        .map_err(|e| EngineError::Unavailable(format!("status task failed: {e}")))?;

        if result.is_ok() {
            metrics::counter!(STATUS_CHANGES_TOTAL, "status" => status.as_str()).increment(1);
        }
        result
    }

    pub async fn cancel(self: &Arc<Self>, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_status(id, AppointmentStatus::Cancelled).await
    }

    async fn commit_status(
        &self,
        id: Ulid,
        professional_id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let cell = self
            .existing_ledger(&professional_id)
            .ok_or(EngineError::NotFound(id))?;
        let scope = cell.scope.lock().await;

        let current = cell
            .state
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let from = current.status;
        check_transition(from, status)?;

        let event = Event::AppointmentStatusChanged {
            id,
            professional_id,
            status,
        };
        self.wal_append(&event).await?;
        {
            let mut ledger = cell.state.write().await;
            apply_to_ledger(&mut ledger, &event, &self.appointment_index);
        }
        drop(scope);

        let updated = Appointment { status, ..current };
        self.notify
            .publish(&ChangeEvent::appointment(&updated, ChangeType::Update));
        info!(appointment = %id, from = %from, to = %status, "appointment status changed");
        Ok(updated)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    /// Every writer is blocked for the duration: the admin lock first, then
    /// each ledger scope in id order.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        let mut cells: Vec<(Ulid, super::SharedLedger)> = self
            .ledgers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        cells.sort_by_key(|(id, _)| *id);
        let mut scopes = Vec::with_capacity(cells.len());
        for (_, cell) in &cells {
            scopes.push(cell.scope.lock().await);
        }

        let mut events = Vec::new();
        let mut clinics: Vec<ClinicSchedule> =
            self.clinics.iter().map(|e| e.value().clone()).collect();
        clinics.sort_by_key(|c| c.id);
        for clinic in clinics {
            events.push(Event::ClinicCreated {
                id: clinic.id,
                name: clinic.name.clone(),
                timezone: clinic.timezone.name().to_string(),
            });
            for hours in &clinic.hours {
                events.push(Event::HoursAdded {
                    clinic_id: clinic.id,
                    hours: *hours,
                });
            }
            for date in &clinic.closures {
                events.push(Event::ClosureAdded {
                    clinic_id: clinic.id,
                    date: *date,
                });
            }
        }
        events.extend(
            self.professionals
                .iter()
                .map(|e| Event::ProfessionalSaved(e.value().clone())),
        );
        events.extend(self.patients.iter().map(|e| Event::PatientSaved(e.value().clone())));
        events.extend(
            self.appointment_types
                .iter()
                .map(|e| Event::AppointmentTypeSaved(e.value().clone())),
        );
        // Booked records carry their current status, so no status events are needed.
        for (_, cell) in &cells {
            let ledger = cell.state.read().await;
            events.extend(
                ledger
                    .appointments
                    .iter()
                    .cloned()
                    .map(Event::AppointmentBooked),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?;
        drop(scopes);

        match result {
            Ok(()) => {
                info!(events = count, "WAL compacted");
                Ok(())
            }
            Err(e) => {
                warn!("WAL compaction failed: {e}");
                Err(EngineError::Unavailable(format!("WAL compaction failed: {e}")))
            }
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_validation() {
        let ok = OpeningHours { weekday: 1, open: 480, close: 720 };
        assert!(validate_hours(&ok).is_ok());
        for bad in [
            OpeningHours { weekday: 7, open: 480, close: 720 },
            OpeningHours { weekday: 1, open: 720, close: 720 },
            OpeningHours { weekday: 1, open: 800, close: 720 },
            OpeningHours { weekday: 1, open: 0, close: 1441 },
        ] {
            assert!(matches!(validate_hours(&bad), Err(EngineError::InvalidArgument(_))), "{bad:?}");
        }
        assert!(validate_hours(&OpeningHours { weekday: 6, open: 0, close: 1440 }).is_ok());
    }

    #[test]
    fn color_validation() {
        assert!(validate_color(&None).is_ok());
        assert!(validate_color(&Some("#1a2B3c".into())).is_ok());
        for bad in ["1a2b3c", "#12345", "#12345g", "red"] {
            assert!(validate_color(&Some(bad.into())).is_err(), "{bad}");
        }
    }
}
