use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only absolute time type.
pub type Ms = i64;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MINUTES_PER_DAY: u16 = 1440;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Calendar rules ───────────────────────────────────────────────

/// One open/close pair on a weekday. Times are minutes past local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub open: u16,
    pub close: u16,
}

impl OpeningHours {
    pub fn overlaps(&self, other: &OpeningHours) -> bool {
        self.weekday == other.weekday && self.open < other.close && other.open < self.close
    }
}

#[derive(Debug, Clone)]
pub struct ClinicSchedule {
    pub id: Ulid,
    pub name: Option<String>,
    pub timezone: Tz,
    /// Sorted by `(weekday, open)`. Same-weekday entries never overlap.
    pub hours: Vec<OpeningHours>,
    /// Local dates on which the clinic is closed regardless of weekday hours.
    pub closures: BTreeSet<NaiveDate>,
}

impl ClinicSchedule {
    pub fn new(id: Ulid, name: Option<String>, timezone: Tz) -> Self {
        Self {
            id,
            name,
            timezone,
            hours: Vec::new(),
            closures: BTreeSet::new(),
        }
    }

    /// Insert maintaining `(weekday, open)` order. Caller checks overlap first.
    pub fn insert_hours(&mut self, hours: OpeningHours) {
        let pos = self
            .hours
            .binary_search_by_key(&(hours.weekday, hours.open), |h| (h.weekday, h.open))
            .unwrap_or_else(|e| e);
        self.hours.insert(pos, hours);
    }

    /// Drop the hours of one weekday, or all of them when `weekday` is `None`.
    pub fn clear_hours(&mut self, weekday: Option<u8>) {
        match weekday {
            Some(day) => self.hours.retain(|h| h.weekday != day),
            None => self.hours.clear(),
        }
    }

    /// Intervals configured for `weekday`, ascending by open time.
    pub fn hours_for(&self, weekday: u8) -> &[OpeningHours] {
        let lo = self.hours.partition_point(|h| h.weekday < weekday);
        let hi = self.hours.partition_point(|h| h.weekday <= weekday);
        &self.hours[lo..hi]
    }

    /// First existing interval that `candidate` would overlap.
    pub fn overlapping_hours(&self, candidate: &OpeningHours) -> Option<&OpeningHours> {
        self.hours_for(candidate.weekday)
            .iter()
            .find(|h| h.overlaps(candidate))
    }

    pub fn is_closed_on(&self, date: NaiveDate) -> bool {
        self.closures.contains(&date)
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no-show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            "no-show" | "no_show" | "noshow" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }

    /// Cancelled and no-show appointments no longer occupy the calendar.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    /// `scheduled|confirmed -> {confirmed, completed, cancelled, no-show}`.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        !self.is_terminal() && next != AppointmentStatus::Scheduled
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub clinic_id: Ulid,
    pub professional_id: Ulid,
    pub patient_id: Ulid,
    pub type_id: Ulid,
    pub start: Ms,
    pub duration_min: u32,
    pub status: AppointmentStatus,
    pub created_at: Ms,
}

impl Appointment {
    pub fn end(&self) -> Ms {
        self.start + Ms::from(self.duration_min) * MS_PER_MINUTE
    }

    pub fn span(&self) -> Span {
        Span::new(self.start, self.end())
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// A booking request as received by the coordinator. `id` is generated when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Option<Ulid>,
    pub clinic_id: Ulid,
    pub professional_id: Ulid,
    pub patient_id: Ulid,
    pub type_id: Ulid,
    pub start: Ms,
    pub duration_minutes: i64,
}

// ── Directories ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Professional {
    pub id: Ulid,
    pub name: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Ulid,
    pub name: Option<String>,
}

/// Carries a display color only; no scheduling semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentType {
    pub id: Ulid,
    pub name: Option<String>,
    pub color: Option<String>,
}

// ── Computed values ──────────────────────────────────────────────

/// A bookable start time. Computed per query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub duration_min: u32,
    /// Wall-clock start in the clinic's timezone.
    pub local: NaiveTime,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + Ms::from(self.duration_min) * MS_PER_MINUTE)
    }

    /// `HH:MM`, 24-hour, clinic local time.
    pub fn label(&self) -> String {
        self.local.format("%H:%M").to_string()
    }
}

/// Calendar row: an appointment plus whether it belongs to another clinic than the one viewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub appointment: Appointment,
    pub other_clinic: bool,
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClinicCreated {
        id: Ulid,
        name: Option<String>,
        timezone: String,
    },
    HoursAdded {
        clinic_id: Ulid,
        hours: OpeningHours,
    },
    HoursCleared {
        clinic_id: Ulid,
        weekday: Option<u8>,
    },
    ClosureAdded {
        clinic_id: Ulid,
        date: NaiveDate,
    },
    ClosureRemoved {
        clinic_id: Ulid,
        date: NaiveDate,
    },
    ProfessionalSaved(Professional),
    PatientSaved(Patient),
    AppointmentTypeSaved(AppointmentType),
    AppointmentBooked(Appointment),
    AppointmentStatusChanged {
        id: Ulid,
        professional_id: Ulid,
        status: AppointmentStatus,
    },
}

// ── Change notification payload ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
}

/// Advisory "schedule changed" signal. Receivers re-fetch; the payload is not authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity: &'static str,
    pub id: Ulid,
    pub change_type: ChangeType,
    #[serde(skip)]
    pub professional_id: Ulid,
}

impl ChangeEvent {
    pub fn appointment(appointment: &Appointment, change_type: ChangeType) -> Self {
        Self {
            entity: "appointment",
            id: appointment.id,
            change_type,
            professional_id: appointment.professional_id,
        }
    }

    /// JSON body relayed to listeners, e.g. `{"entity":"appointment","id":"…","changeType":"insert"}`.
    pub fn payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(start: Ms, duration_min: u32, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            clinic_id: Ulid::new(),
            professional_id: Ulid::new(),
            patient_id: Ulid::new(),
            type_id: Ulid::new(),
            start,
            duration_min,
            status,
            created_at: 0,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn appointment_span_uses_minutes() {
        let a = appt(1_000, 30, AppointmentStatus::Scheduled);
        assert_eq!(a.end(), 1_000 + 30 * MS_PER_MINUTE);
        assert_eq!(a.span().duration_ms(), 1_800_000);
    }

    #[test]
    fn cancelled_and_no_show_are_inactive() {
        assert!(AppointmentStatus::Scheduled.is_active());
        assert!(AppointmentStatus::Confirmed.is_active());
        assert!(AppointmentStatus::Completed.is_active());
        assert!(!AppointmentStatus::Cancelled.is_active());
        assert!(!AppointmentStatus::NoShow.is_active());
    }

    #[test]
    fn status_transitions() {
        use AppointmentStatus::*;
        for from in [Scheduled, Confirmed] {
            for to in [Confirmed, Completed, Cancelled, NoShow] {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
            assert!(!from.can_transition_to(Scheduled));
        }
        for from in [Completed, Cancelled, NoShow] {
            for to in [Scheduled, Confirmed, Completed, Cancelled, NoShow] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_parse_accepts_spellings() {
        assert_eq!(AppointmentStatus::parse("No-Show"), Some(AppointmentStatus::NoShow));
        assert_eq!(AppointmentStatus::parse("no_show"), Some(AppointmentStatus::NoShow));
        assert_eq!(AppointmentStatus::parse("canceled"), Some(AppointmentStatus::Cancelled));
        assert_eq!(AppointmentStatus::parse("done"), None);
    }

    #[test]
    fn hours_for_returns_only_that_weekday_in_order() {
        let mut cs = ClinicSchedule::new(Ulid::new(), None, Tz::UTC);
        cs.insert_hours(OpeningHours { weekday: 2, open: 840, close: 1080 });
        cs.insert_hours(OpeningHours { weekday: 1, open: 480, close: 720 });
        cs.insert_hours(OpeningHours { weekday: 2, open: 480, close: 720 });
        cs.insert_hours(OpeningHours { weekday: 3, open: 480, close: 720 });

        let tuesday = cs.hours_for(2);
        assert_eq!(tuesday.len(), 2);
        assert_eq!(tuesday[0].open, 480);
        assert_eq!(tuesday[1].open, 840);
        assert!(cs.hours_for(0).is_empty());
    }

    #[test]
    fn overlapping_hours_detects_same_weekday_only() {
        let mut cs = ClinicSchedule::new(Ulid::new(), None, Tz::UTC);
        cs.insert_hours(OpeningHours { weekday: 1, open: 480, close: 720 });

        let clash = OpeningHours { weekday: 1, open: 700, close: 800 };
        let adjacent = OpeningHours { weekday: 1, open: 720, close: 800 };
        let other_day = OpeningHours { weekday: 2, open: 480, close: 720 };
        assert!(cs.overlapping_hours(&clash).is_some());
        assert!(cs.overlapping_hours(&adjacent).is_none());
        assert!(cs.overlapping_hours(&other_day).is_none());
    }

    #[test]
    fn clear_hours_single_day() {
        let mut cs = ClinicSchedule::new(Ulid::new(), None, Tz::UTC);
        cs.insert_hours(OpeningHours { weekday: 1, open: 480, close: 720 });
        cs.insert_hours(OpeningHours { weekday: 2, open: 480, close: 720 });
        cs.clear_hours(Some(1));
        assert!(cs.hours_for(1).is_empty());
        assert_eq!(cs.hours_for(2).len(), 1);
        cs.clear_hours(None);
        assert!(cs.hours.is_empty());
    }

    #[test]
    fn slot_label_is_local_hh_mm() {
        let slot = Slot {
            start: 0,
            duration_min: 30,
            local: NaiveTime::from_hms_opt(8, 5, 0).unwrap(),
        };
        assert_eq!(slot.label(), "08:05");
    }

    #[test]
    fn change_event_json_shape() {
        let a = appt(0, 30, AppointmentStatus::Scheduled);
        let ev = ChangeEvent::appointment(&a, ChangeType::Insert);
        let json: serde_json::Value = serde_json::from_str(&ev.payload().unwrap()).unwrap();
        assert_eq!(json["entity"], "appointment");
        assert_eq!(json["id"], a.id.to_string());
        assert_eq!(json["changeType"], "insert");
        assert!(json.get("professionalId").is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ClosureAdded {
            clinic_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 12, 25).unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
