use chrono::{NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::*;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Lazily generate bookable slots for one local day.
///
/// Candidates start at each interval's `open` and step by `granularity_min`
/// while `start + duration <= close`. A candidate survives only if it does not
/// overlap any span in `busy`, which must be sorted and disjoint
/// (see [`merge_overlapping`]). Local times that do not exist in `tz`
/// (DST gap) are skipped; ambiguous ones resolve to the earliest instant.
pub fn slot_candidates<'a>(
    date: NaiveDate,
    tz: Tz,
    hours: &'a [OpeningHours],
    busy: &'a [Span],
    duration_min: u32,
    granularity_min: u32,
) -> impl Iterator<Item = Slot> + 'a {
    hours
        .iter()
        .flat_map(move |h| {
            let close = u32::from(h.close);
            (u32::from(h.open)..close)
                .step_by(granularity_min.max(1) as usize)
                .take_while(move |m| m + duration_min <= close)
        })
        .filter_map(move |minute| {
            let local = NaiveTime::from_num_seconds_from_midnight_opt(minute * 60, 0)?;
            let start = local_instant(date, local, tz)?;
            Some(Slot {
                start,
                duration_min,
                local,
            })
        })
        .filter(move |slot| !overlaps_any(busy, &slot.span()))
}

/// Absolute instant of a local wall-clock time, earliest on ambiguity.
pub fn local_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<Ms> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// `[start of date, start of date + 1)` in absolute time.
/// Falls forward hour by hour when local midnight does not exist.
pub fn day_window(date: NaiveDate, tz: Tz) -> Option<Span> {
    let start = first_instant_of(date, tz)?;
    let end = first_instant_of(date.succ_opt()?, tz)?;
    (start < end).then(|| Span::new(start, end))
}

/// Range of ledger time that can collide with a slot on `date`.
/// Every candidate starts inside the day window, so its end falls before the
/// window end plus one duration even when a DST jump pushes it past midnight.
pub fn busy_window(date: NaiveDate, tz: Tz, duration_min: u32) -> Option<Span> {
    let day = day_window(date, tz)?;
    Some(Span::new(day.start, day.end + Ms::from(duration_min) * MS_PER_MINUTE))
}

fn first_instant_of(date: NaiveDate, tz: Tz) -> Option<Ms> {
    (0..3).find_map(|hour| local_instant(date, NaiveTime::from_hms_opt(hour, 0, 0)?, tz))
}

/// Binary search over sorted, disjoint spans.
pub fn overlaps_any(sorted: &[Span], span: &Span) -> bool {
    let idx = sorted.partition_point(|b| b.end <= span.start);
    sorted.get(idx).is_some_and(|b| b.start < span.end)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}
