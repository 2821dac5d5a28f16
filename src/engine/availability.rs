use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

// ── Availability Recalculation ────────────────────────────────────

/// Occupants counted against capacity at `now`: `(current, upcoming)`.
///
/// Current: active with a move-in date that has arrived.
/// Upcoming: accepted, not yet active, moving in after `now`.
/// An active row with a future move-in is inconsistent and lands in neither.
pub fn committed_counts(occupancies: &[Occupancy], now: Timestamp) -> (usize, usize) {
    let mut current = 0;
    let mut upcoming = 0;
    for o in occupancies {
        let Some(joined) = o.joined_at else { continue };
        if o.is_active {
            if joined <= now {
                current += 1;
            }
        } else if o.status == OccupancyStatus::Accepted && joined > now {
            upcoming += 1;
        }
    }
    (current, upcoming)
}

/// Full rescan deciding whether `room` can take another booking. Does not
/// write the flag back; the caller stores it.
pub fn recompute_availability(room: &Room, occupancies: &[Occupancy], now: Timestamp) -> bool {
    let (current, upcoming) = committed_counts(occupancies, now);
    ((current + upcoming) as u64) < u64::from(room.capacity)
}

pub fn availability_info(room: &Room, occupancies: &[Occupancy], now: Timestamp) -> AvailabilityInfo {
    let (current, upcoming) = committed_counts(occupancies, now);
    AvailabilityInfo {
        room_id: room.id,
        capacity: room.capacity,
        current,
        upcoming,
        available: recompute_availability(room, occupancies, now),
    }
}

// ── Roster & stay views ───────────────────────────────────────────

fn departure_key(o: &Occupancy) -> Reverse<Option<Timestamp>> {
    Reverse(o.exit_date.or(o.joined_at))
}

pub fn roster(occupancies: &[Occupancy], now: Timestamp) -> Roster {
    let current = occupancies.iter().filter(|o| o.is_active).cloned().collect();

    let mut upcoming: Vec<Occupancy> = occupancies
        .iter()
        .filter(|o| {
            !o.is_active
                && o.status == OccupancyStatus::Accepted
                && o.joined_at.is_some_and(|j| j > now)
        })
        .cloned()
        .collect();
    upcoming.sort_by_key(|o| o.joined_at);

    let mut past: Vec<Occupancy> = occupancies
        .iter()
        .filter(|o| {
            !o.is_active
                && matches!(o.status, OccupancyStatus::Left | OccupancyStatus::Rejected)
        })
        .cloned()
        .collect();
    past.sort_by_key(departure_key);

    Roster {
        current,
        upcoming,
        past,
    }
}

/// `own` are the resident's occupancies across all rooms; `room_of_current`
/// are the occupancies of the room they currently live in, if any.
pub fn stay_status(
    resident_id: Ulid,
    own: &[Occupancy],
    room_of_current: &[Occupancy],
    now: Timestamp,
) -> StayStatus {
    let current = own
        .iter()
        .find(|o| o.is_active && o.joined_at.is_some_and(|j| j <= now))
        .cloned();

    let roommates = match &current {
        Some(stay) => room_of_current
            .iter()
            .filter(|o| {
                o.room_id == stay.room_id
                    && o.is_active
                    && o.user_id != resident_id
                    && o.joined_at.is_some_and(|j| j <= now)
            })
            .map(|o| o.user_id)
            .collect(),
        None => Vec::new(),
    };

    let mut past: Vec<Occupancy> = own
        .iter()
        .filter(|o| !o.is_active && (o.status == OccupancyStatus::Left || o.exit_date.is_some()))
        .cloned()
        .collect();
    past.sort_by_key(departure_key);

    StayStatus {
        resident_id,
        current,
        roommates,
        past,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ts(y: i32, m: u32, d: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn room(capacity: u32) -> Room {
        Room {
            id: Ulid::new(),
            property_id: Ulid::new(),
            label: None,
            capacity,
            is_available: true,
        }
    }

    fn occ(
        room_id: Ulid,
        joined: Option<Timestamp>,
        active: bool,
        status: OccupancyStatus,
    ) -> Occupancy {
        Occupancy {
            id: Ulid::new(),
            room_id,
            user_id: Ulid::new(),
            request_id: None,
            requested_at: ts(2024, 1, 1),
            joined_at: joined,
            exit_date: None,
            is_active: active,
            status,
        }
    }

    #[test]
    fn empty_room_is_available() {
        let r = room(1);
        assert!(recompute_availability(&r, &[], ts(2025, 1, 1)));
    }

    #[test]
    fn future_commitment_fills_room() {
        let now = ts(2025, 6, 1);
        let r = room(1);
        let tomorrow = now + Duration::days(1);
        let o = occ(r.id, Some(tomorrow), false, OccupancyStatus::Accepted);
        assert!(!recompute_availability(&r, &[o], now));
    }

    #[test]
    fn current_plus_upcoming_against_capacity() {
        let now = ts(2025, 6, 1);
        let r = room(3);
        let present = occ(r.id, Some(ts(2025, 1, 1)), true, OccupancyStatus::Accepted);
        let later = occ(r.id, Some(ts(2025, 9, 1)), false, OccupancyStatus::Accepted);
        let occupancies = vec![present.clone(), later.clone()];
        assert_eq!(committed_counts(&occupancies, now), (1, 1));
        assert!(recompute_availability(&r, &occupancies, now));

        let third = occ(r.id, Some(ts(2025, 10, 1)), false, OccupancyStatus::Accepted);
        assert!(!recompute_availability(&r, &[present, later, third], now));
    }

    #[test]
    fn departed_and_undated_are_not_counted() {
        let now = ts(2025, 6, 1);
        let r = room(1);
        let left = occ(r.id, Some(ts(2025, 1, 1)), false, OccupancyStatus::Left);
        let undated = occ(r.id, None, true, OccupancyStatus::Accepted);
        let rejected = occ(r.id, Some(ts(2025, 9, 1)), false, OccupancyStatus::Rejected);
        assert_eq!(committed_counts(&[left.clone(), undated.clone(), rejected.clone()], now), (0, 0));
        assert!(recompute_availability(&r, &[left, undated, rejected], now));
    }

    #[test]
    fn inconsistent_active_future_row_is_not_counted() {
        let now = ts(2025, 6, 1);
        let r = room(1);
        let odd = occ(r.id, Some(ts(2025, 9, 1)), true, OccupancyStatus::Accepted);
        assert_eq!(committed_counts(std::slice::from_ref(&odd), now), (0, 0));
        assert!(recompute_availability(&r, &[odd], now));
    }

    #[test]
    fn zero_capacity_is_never_available() {
        assert!(!recompute_availability(&room(0), &[], ts(2025, 1, 1)));
    }

    #[test]
    fn recompute_is_idempotent() {
        let now = ts(2025, 6, 1);
        let r = room(2);
        let occupancies = vec![occ(r.id, Some(ts(2025, 1, 1)), true, OccupancyStatus::Accepted)];
        let first = recompute_availability(&r, &occupancies, now);
        let second = recompute_availability(&r, &occupancies, now);
        assert_eq!(first, second);
    }

    #[test]
    fn availability_info_reports_counts() {
        let now = ts(2025, 6, 1);
        let r = room(2);
        let occupancies = vec![
            occ(r.id, Some(ts(2025, 1, 1)), true, OccupancyStatus::Accepted),
            occ(r.id, Some(ts(2025, 8, 1)), false, OccupancyStatus::Accepted),
        ];
        let info = availability_info(&r, &occupancies, now);
        assert_eq!(info.current, 1);
        assert_eq!(info.upcoming, 1);
        assert!(!info.available);
    }

    #[test]
    fn roster_buckets_and_order() {
        let now = ts(2025, 6, 1);
        let rid = Ulid::new();
        let present = occ(rid, Some(ts(2025, 1, 1)), true, OccupancyStatus::Accepted);
        let late = occ(rid, Some(ts(2025, 12, 1)), false, OccupancyStatus::Accepted);
        let soon = occ(rid, Some(ts(2025, 7, 1)), false, OccupancyStatus::Accepted);
        let mut left_early = occ(rid, Some(ts(2024, 1, 1)), false, OccupancyStatus::Left);
        left_early.exit_date = Some(ts(2024, 6, 1));
        let mut left_late = occ(rid, Some(ts(2024, 3, 1)), false, OccupancyStatus::Left);
        left_late.exit_date = Some(ts(2025, 2, 1));

        let roster = roster(
            &[present.clone(), late.clone(), soon.clone(), left_early.clone(), left_late.clone()],
            now,
        );
        assert_eq!(roster.current, vec![present]);
        assert_eq!(roster.upcoming, vec![soon, late]);
        assert_eq!(roster.past, vec![left_late, left_early]);
    }

    #[test]
    fn stay_status_finds_roommates() {
        let now = ts(2025, 6, 1);
        let rid = Ulid::new();
        let resident = Ulid::new();

        let mut mine = occ(rid, Some(ts(2025, 1, 1)), true, OccupancyStatus::Accepted);
        mine.user_id = resident;
        let mate = occ(rid, Some(ts(2025, 2, 1)), true, OccupancyStatus::Accepted);
        let incoming = occ(rid, Some(ts(2025, 9, 1)), false, OccupancyStatus::Accepted);
        let mut old = occ(Ulid::new(), Some(ts(2023, 1, 1)), false, OccupancyStatus::Left);
        old.user_id = resident;
        old.exit_date = Some(ts(2024, 1, 1));

        let status = stay_status(
            resident,
            &[old.clone(), mine.clone()],
            &[mine.clone(), mate.clone(), incoming],
            now,
        );
        assert_eq!(status.current, Some(mine));
        assert_eq!(status.roommates, vec![mate.user_id]);
        assert_eq!(status.past, vec![old]);
    }

    #[test]
    fn stay_status_without_current_stay() {
        let now = ts(2025, 6, 1);
        let resident = Ulid::new();
        let mut upcoming = occ(Ulid::new(), Some(ts(2025, 9, 1)), false, OccupancyStatus::Accepted);
        upcoming.user_id = resident;
        let status = stay_status(resident, &[upcoming], &[], now);
        assert!(status.current.is_none());
        assert!(status.roommates.is_empty());
        assert!(status.past.is_empty());
    }
}
