use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::availability::{self, availability_info, roster};
use super::{Engine, EngineError};

impl Engine {
    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    pub fn get_property(&self, id: &Ulid) -> Option<Property> {
        self.properties.get(id).map(|p| p.clone())
    }

    /// The caller's own user record.
    pub fn profile(&self, principal: &Principal) -> Result<User, EngineError> {
        self.get_user(&principal.user_id)
            .ok_or(EngineError::NotFound(principal.user_id))
    }

    fn summarize(&self, property: Property) -> PropertySummary {
        let room_count = self
            .property_rooms
            .get(&property.id)
            .map_or(0, |r| r.len());
        PropertySummary {
            property,
            room_count,
        }
    }

    /// Properties owned by a host, ordered by id.
    pub fn list_properties(&self, principal: &Principal) -> Result<Vec<PropertySummary>, EngineError> {
        if principal.role != Role::Host {
            return Err(EngineError::Forbidden("host role required"));
        }
        let mut owned: Vec<Property> = self
            .properties
            .iter()
            .filter(|p| p.owner_id == principal.user_id)
            .map(|p| p.clone())
            .collect();
        owned.sort_by_key(|p| p.id);
        Ok(owned.into_iter().map(|p| self.summarize(p)).collect())
    }

    /// One property, visible to its owner only.
    pub fn property_details(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<PropertySummary, EngineError> {
        if principal.role != Role::Host {
            return Err(EngineError::Forbidden("host role required"));
        }
        let property = self.get_property(&id).ok_or(EngineError::NotFound(id))?;
        if property.owner_id != principal.user_id {
            return Err(EngineError::Forbidden("not the owner of this property"));
        }
        Ok(self.summarize(property))
    }

    /// Rooms, optionally limited to one property and/or to rooms that can
    /// still take a booking. Ordered by id.
    pub async fn list_rooms(&self, property_id: Option<Ulid>, only_available: bool) -> Vec<Room> {
        let ids: Vec<Ulid> = match property_id {
            Some(pid) => self
                .property_rooms
                .get(&pid)
                .map(|r| r.clone())
                .unwrap_or_default(),
            None => self.rooms.iter().map(|e| *e.key()).collect(),
        };

        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(rs) = self.get_room(&id) else { continue };
            let guard = rs.read().await;
            if !only_available || guard.room.is_available {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub async fn room_availability(
        &self,
        room_id: Ulid,
        now: Timestamp,
    ) -> Result<AvailabilityInfo, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(availability_info(&guard.room, &guard.occupancies, now))
    }

    pub async fn room_roster(&self, room_id: Ulid, now: Timestamp) -> Result<Roster, EngineError> {
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(roster(&guard.occupancies, now))
    }

    /// Rooms whose requests `principal` may see: a resident's own rooms, or
    /// every room of a host's properties.
    fn visible_rooms(&self, principal: &Principal) -> Result<Vec<Ulid>, EngineError> {
        match principal.role {
            Role::Resident => Ok(self
                .resident_rooms
                .get(&principal.user_id)
                .map(|r| r.clone())
                .unwrap_or_default()),
            Role::Host => {
                let owned: Vec<Ulid> = self
                    .properties
                    .iter()
                    .filter(|p| p.owner_id == principal.user_id)
                    .map(|p| p.id)
                    .collect();
                Ok(owned
                    .iter()
                    .filter_map(|pid| self.property_rooms.get(pid).map(|r| r.clone()))
                    .flatten()
                    .collect())
            }
            Role::Guardian => Err(EngineError::Forbidden("resident or host role required")),
        }
    }

    /// Requests visible to `principal`, newest first.
    pub async fn requests_for(
        &self,
        principal: &Principal,
        property_id: Option<Ulid>,
        status: Option<BookingStatus>,
    ) -> Result<Vec<BookingRequest>, EngineError> {
        let mut out = Vec::new();
        for room_id in self.visible_rooms(principal)? {
            let Some(rs) = self.get_room(&room_id) else { continue };
            let guard = rs.read().await;
            if property_id.is_some_and(|pid| pid != guard.room.property_id) {
                continue;
            }
            out.extend(
                guard
                    .requests
                    .iter()
                    .filter(|r| principal.role != Role::Resident || r.resident_id == principal.user_id)
                    .filter(|r| status.is_none_or(|s| r.status == s))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| Reverse((r.created_at, r.id)));
        Ok(out)
    }

    pub async fn pending_count(&self, principal: &Principal) -> Result<usize, EngineError> {
        Ok(self
            .requests_for(principal, None, Some(BookingStatus::Pending))
            .await?
            .len())
    }

    /// Current stay, roommates and past stays of a resident. Visible to the
    /// resident and to guardians with an accepted link.
    pub async fn stay_status(
        &self,
        principal: &Principal,
        resident_id: Ulid,
        now: Timestamp,
    ) -> Result<StayStatus, EngineError> {
        let allowed = principal.user_id == resident_id
            || (principal.role == Role::Guardian
                && self.links.iter().any(|l| {
                    l.links(principal.user_id, resident_id) && l.status == LinkStatus::Accepted
                }));
        if !allowed {
            return Err(EngineError::Forbidden("no accepted guardian link to this resident"));
        }
        match self.users.get(&resident_id).map(|u| u.role) {
            Some(Role::Resident) => {}
            _ => return Err(EngineError::NotFound(resident_id)),
        }

        let room_ids = self
            .resident_rooms
            .get(&resident_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        let mut own = Vec::new();
        for room_id in &room_ids {
            let Some(rs) = self.get_room(room_id) else { continue };
            let guard = rs.read().await;
            own.extend(
                guard
                    .occupancies
                    .iter()
                    .filter(|o| o.user_id == resident_id)
                    .cloned(),
            );
        }

        let current_room = own
            .iter()
            .find(|o| o.is_active && o.joined_at.is_some_and(|j| j <= now))
            .map(|o| o.room_id);
        let room_of_current = match current_room.and_then(|id| self.get_room(&id)) {
            Some(rs) => rs.read().await.occupancies.clone(),
            None => Vec::new(),
        };

        Ok(availability::stay_status(resident_id, &own, &room_of_current, now))
    }

    /// Links the principal takes part in, oldest first.
    pub fn guardian_links(&self, principal: &Principal) -> Vec<GuardianLink> {
        let mut links: Vec<GuardianLink> = self
            .links
            .iter()
            .filter(|l| l.involves(principal.user_id))
            .map(|l| l.clone())
            .collect();
        links.sort_by_key(|l| (l.requested_at, l.id));
        links
    }
}
