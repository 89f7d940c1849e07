use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Positive, bounded minute count.
pub(crate) fn validate_minutes(value: i64, max: i64, what: &str) -> Result<u32, EngineError> {
    if value <= 0 {
        return Err(EngineError::invalid(format!("{what} must be positive, got {value}")));
    }
    if value > max {
        return Err(EngineError::invalid(format!("{what} exceeds {max} minutes")));
    }
    u32::try_from(value).map_err(|_| EngineError::invalid(format!("{what} out of range")))
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::invalid("window start must be before end"));
    }
    let span = Span::new(start, end);
    validate_span(&span)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

/// Input checks done before any resource access. Returns the duration in minutes.
pub(crate) fn validate_booking(req: &BookingRequest, now: Ms) -> Result<u32, EngineError> {
    let duration = validate_minutes(req.duration_minutes, MAX_DURATION_MINUTES, "duration")?;
    if req.start < now {
        return Err(EngineError::invalid("start is in the past"));
    }
    if req.start > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(req.start, req.start + Ms::from(duration) * MS_PER_MINUTE);
    validate_span(&span)?;
    Ok(duration)
}

pub(crate) fn check_transition(
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn request(start: Ms, duration_minutes: i64) -> BookingRequest {
        BookingRequest {
            id: None,
            clinic_id: Ulid::new(),
            professional_id: Ulid::new(),
            patient_id: Ulid::new(),
            type_id: Ulid::new(),
            start,
            duration_minutes,
        }
    }

    #[test]
    fn non_positive_duration_rejected() {
        for d in [0, -30] {
            let err = validate_booking(&request(10_000, d), 0).unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)), "{d}: {err}");
        }
    }

    #[test]
    fn past_start_rejected() {
        let err = validate_booking(&request(999, 30), 1_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(validate_booking(&request(1_000, 30), 1_000).is_ok());
    }

    #[test]
    fn duration_over_a_day_rejected() {
        let err = validate_booking(&request(10_000, MAX_DURATION_MINUTES + 1), 0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn timestamp_beyond_range_rejected() {
        let err = validate_booking(&request(MAX_VALID_TIMESTAMP_MS, 30), 0).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }

    #[test]
    fn window_checks() {
        assert!(matches!(validate_window(10, 10), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(
            validate_window(0, MAX_QUERY_WINDOW_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
        assert_eq!(validate_window(0, 100).unwrap(), Span::new(0, 100));
    }

    #[test]
    fn extreme_window_bounds_rejected_without_overflow() {
        assert!(matches!(
            validate_window(Ms::MIN, Ms::MAX),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_window(-Ms::MAX, Ms::MAX),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_window(0, Ms::MAX),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn terminal_transition_rejected() {
        let err = check_transition(AppointmentStatus::Completed, AppointmentStatus::Cancelled)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: AppointmentStatus::Completed,
                to: AppointmentStatus::Cancelled
            }
        ));
    }
}
