use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::dates;

/// UTC instant. Every time value in the crate uses it.
pub type Timestamp = DateTime<Utc>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Lists properties and rooms, decides on booking requests.
    Host,
    Resident,
    /// Linked to residents; read-only view of their stays.
    Guardian,
}

impl Role {
    /// `owner` is accepted as a synonym for `host`.
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_lowercase().as_str() {
            "host" | "owner" => Some(Role::Host),
            "resident" => Some(Role::Resident),
            "guardian" => Some(Role::Guardian),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Resident => "resident",
            Role::Guardian => "guardian",
        }
    }
}

/// The authenticated caller of a workflow operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub registered_at: Timestamp,
}

impl User {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.id,
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub city: Option<String>,
}

// ── Rooms, stays, requests ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: Ulid,
    pub property_id: Ulid,
    pub label: Option<String>,
    pub capacity: u32,
    /// Cached output of the availability recalculation.
    pub is_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyStatus {
    Requested,
    Accepted,
    Rejected,
    Left,
}

impl OccupancyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccupancyStatus::Requested => "requested",
            OccupancyStatus::Accepted => "accepted",
            OccupancyStatus::Rejected => "rejected",
            OccupancyStatus::Left => "left",
        }
    }
}

/// One resident's stay (past, current, or committed for the future) in a room.
/// Never deleted; departures only change `status` and `is_active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    /// The booking request this stay was spawned from. Absent for imported rows.
    pub request_id: Option<Ulid>,
    pub requested_at: Timestamp,
    pub joined_at: Option<Timestamp>,
    pub exit_date: Option<Timestamp>,
    /// True only while the occupant is physically present.
    pub is_active: bool,
    pub status: OccupancyStatus,
}

impl Occupancy {
    /// Counted against capacity: present now, or accepted for later.
    pub fn is_committed(&self) -> bool {
        self.is_active || self.status == OccupancyStatus::Accepted
    }

    /// The stay as an interval, with the legacy exit fallback applied.
    /// `None` when the move-in date is unknown.
    pub fn stay_span(&self) -> Option<Span> {
        let joined = self.joined_at?;
        let end = dates::effective_exit(joined, self.exit_date)?;
        Some(Span::new(joined, end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl BookingStatus {
    pub fn parse(s: &str) -> Option<BookingStatus> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "accepted" => Some(BookingStatus::Accepted),
            "declined" => Some(BookingStatus::Declined),
            "expired" => Some(BookingStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Declined => "declined",
            BookingStatus::Expired => "expired",
        }
    }
}

/// A resident's ask to occupy a room from `move_in` for `months` calendar months.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub room_id: Ulid,
    pub resident_id: Ulid,
    pub move_in: Timestamp,
    pub months: u32,
    pub status: BookingStatus,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub note: Option<String>,
}

impl BookingRequest {
    /// `move_in + months`, calendar-month arithmetic.
    pub fn end_date(&self) -> Option<Timestamp> {
        dates::add_months(self.move_in, self.months)
    }

    pub fn is_pending(&self) -> bool {
        self.status == BookingStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    Pending,
    Accepted,
    Declined,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Accepted => "accepted",
            LinkStatus::Declined => "declined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianLink {
    pub id: Ulid,
    pub guardian_id: Ulid,
    pub resident_id: Ulid,
    pub requested_by: Ulid,
    pub status: LinkStatus,
    pub requested_at: Timestamp,
    pub responded_at: Option<Timestamp>,
}

impl GuardianLink {
    pub fn involves(&self, user_id: Ulid) -> bool {
        self.guardian_id == user_id || self.resident_id == user_id
    }

    pub fn links(&self, a: Ulid, b: Ulid) -> bool {
        (self.guardian_id == a && self.resident_id == b)
            || (self.guardian_id == b && self.resident_id == a)
    }
}

// ── Per-room state ───────────────────────────────────────────────

/// Everything that has to be read and written under one room's lock.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Sorted by `joined_at` (unknown move-in dates first).
    pub occupancies: Vec<Occupancy>,
    /// In submission order.
    pub requests: Vec<BookingRequest>,
}

impl RoomState {
    pub fn new(id: Ulid, property_id: Ulid, label: Option<String>, capacity: u32) -> Self {
        Self {
            room: Room {
                id,
                property_id,
                label,
                capacity,
                is_available: capacity > 0,
            },
            occupancies: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.occupancies.len() + self.requests.len()
    }

    /// Insert occupancy maintaining sort order by `joined_at`.
    pub fn insert_occupancy(&mut self, occupancy: Occupancy) {
        let pos = self
            .occupancies
            .partition_point(|o| o.joined_at <= occupancy.joined_at);
        self.occupancies.insert(pos, occupancy);
    }

    pub fn occupancy_mut(&mut self, id: Ulid) -> Option<&mut Occupancy> {
        self.occupancies.iter_mut().find(|o| o.id == id)
    }

    pub fn request(&self, id: Ulid) -> Option<&BookingRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn request_mut(&mut self, id: Ulid) -> Option<&mut BookingRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }
}

/// Flat event records; this is the WAL payload format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
        at: Timestamp,
    },
    PropertyCreated {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        city: Option<String>,
    },
    RoomCreated {
        id: Ulid,
        property_id: Ulid,
        label: Option<String>,
        capacity: u32,
    },
    RoomUpdated {
        id: Ulid,
        label: Option<String>,
        capacity: u32,
    },
    RoomDeleted {
        id: Ulid,
    },
    RequestSubmitted {
        id: Ulid,
        room_id: Ulid,
        resident_id: Ulid,
        move_in: Timestamp,
        months: u32,
        created_at: Timestamp,
        expires_at: Timestamp,
    },
    RequestAccepted {
        id: Ulid,
        room_id: Ulid,
        occupancy_id: Ulid,
        joined_at: Timestamp,
        exit_date: Timestamp,
        active: bool,
        note: String,
    },
    RequestDeclined {
        id: Ulid,
        room_id: Ulid,
        note: String,
    },
    RequestExpired {
        id: Ulid,
        room_id: Ulid,
    },
    OccupancyActivated {
        id: Ulid,
        room_id: Ulid,
    },
    OccupancyEnded {
        id: Ulid,
        room_id: Ulid,
        exit_date: Timestamp,
    },
    GuardianLinkRequested {
        id: Ulid,
        guardian_id: Ulid,
        resident_id: Ulid,
        requested_by: Ulid,
        at: Timestamp,
    },
    GuardianLinkResponded {
        id: Ulid,
        accepted: bool,
        at: Timestamp,
    },
    /// Full replacement of the editable property fields.
    PropertyUpdated {
        id: Ulid,
        name: String,
        city: Option<String>,
    },
    ProfileUpdated {
        id: Ulid,
        name: String,
        email: String,
    },
}

impl Event {
    /// The room whose lock covers this event, if any.
    pub fn room_id(&self) -> Option<Ulid> {
        match self {
            Event::RoomUpdated { id, .. } => Some(*id),
            Event::RequestSubmitted { room_id, .. }
            | Event::RequestAccepted { room_id, .. }
            | Event::RequestDeclined { room_id, .. }
            | Event::RequestExpired { room_id, .. }
            | Event::OccupancyActivated { room_id, .. }
            | Event::OccupancyEnded { room_id, .. } => Some(*room_id),
            Event::UserRegistered { .. }
            | Event::PropertyCreated { .. }
            | Event::RoomCreated { .. }
            | Event::RoomDeleted { .. }
            | Event::GuardianLinkRequested { .. }
            | Event::GuardianLinkResponded { .. }
            | Event::PropertyUpdated { .. }
            | Event::ProfileUpdated { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityInfo {
    pub room_id: Ulid,
    pub capacity: u32,
    pub current: usize,
    pub upcoming: usize,
    pub available: bool,
}

/// A room's occupancies split the way a host or visitor reads them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub current: Vec<Occupancy>,
    /// Ascending by move-in.
    pub upcoming: Vec<Occupancy>,
    /// Most recent departure first.
    pub past: Vec<Occupancy>,
}

/// A host's property with how many rooms it lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySummary {
    pub property: Property,
    pub room_count: usize,
}

/// What a guardian sees for a linked resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StayStatus {
    pub resident_id: Ulid,
    pub current: Option<Occupancy>,
    pub roommates: Vec<Ulid>,
    pub past: Vec<Occupancy>,
}
