use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Outcome of checking a pending request against a room's existing stays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub approved: bool,
    /// Stays overlapping the requested window, earliest move-in first,
    /// capped at `MAX_REPORTED_CONFLICTS`.
    pub conflicts: Vec<Occupancy>,
}

pub(crate) fn validate_months(months: u32) -> Result<(), EngineError> {
    if !(MIN_STAY_MONTHS..=MAX_STAY_MONTHS).contains(&months) {
        return Err(EngineError::InvalidArgument("months must be between 1 and 36"));
    }
    Ok(())
}

/// The window a request asks for: `[move_in, move_in + months)`.
pub(crate) fn requested_span(request: &BookingRequest) -> Result<Span, EngineError> {
    let end = request
        .end_date()
        .ok_or(EngineError::InvalidArgument("stay end out of range"))?;
    Ok(Span::new(request.move_in, end))
}

/// Would accepting `request` put more committed occupants in `room` than it
/// has beds, at any point of the requested stay?
///
/// Each committed stay (present now, or accepted for later) with a known
/// move-in date is tested pairwise against the requested window; stays with no
/// exit date run for `LEGACY_STAY_MONTHS`. Every overlapping record counts,
/// including two records for the same resident. The request is rejected once
/// the count reaches capacity. Only one new interval is inserted per call, so
/// the pairwise count is the peak over the window.
///
/// Pure: the caller must hold the room's lock across this call and the write
/// that follows.
pub fn evaluate_approval(
    request: &BookingRequest,
    room: &Room,
    occupancies: &[Occupancy],
) -> Result<Decision, EngineError> {
    if request.room_id != room.id {
        return Err(EngineError::InvalidArgument("request is for a different room"));
    }
    validate_months(request.months)?;
    let window = requested_span(request)?;

    let mut overlapping: Vec<&Occupancy> = occupancies
        .iter()
        .filter(|o| o.is_committed())
        .filter(|o| o.stay_span().is_some_and(|stay| stay.overlaps(&window)))
        .collect();

    let approved = (overlapping.len() as u64) < u64::from(room.capacity);

    overlapping.sort_by_key(|o| o.joined_at);
    let conflicts = overlapping
        .into_iter()
        .take(MAX_REPORTED_CONFLICTS)
        .cloned()
        .collect();

    Ok(Decision {
        approved,
        conflicts,
    })
}
