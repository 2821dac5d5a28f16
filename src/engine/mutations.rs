use chrono::Duration;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::dates;
use crate::limits::*;
use crate::model::*;
use crate::observability::APPROVALS_TOTAL;

use super::conflict::{requested_span, validate_months};
use super::{Engine, EngineError, WalCommand, evaluate_approval, normalize_email};

fn require_role(principal: &Principal, role: Role) -> Result<(), EngineError> {
    if principal.role != role {
        return Err(EngineError::Forbidden(match role {
            Role::Host => "host role required",
            Role::Resident => "resident role required",
            Role::Guardian => "guardian role required",
        }));
    }
    Ok(())
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.chars().count() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// The exit date to record when a committed stay is over at `now`.
/// Falls back to the legacy stay length when no exit date was stored.
fn finished_exit(o: &Occupancy, now: Timestamp) -> Option<Timestamp> {
    if !o.is_committed() {
        return None;
    }
    let end = o.stay_span().map(|s| s.end).or(o.exit_date)?;
    (end <= now).then_some(end)
}

fn check_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidArgument("capacity must be at least 1"));
    }
    if capacity > MAX_ROOM_CAPACITY {
        return Err(EngineError::LimitExceeded("room capacity too large"));
    }
    Ok(())
}

impl Engine {
    /// The room must belong to a property owned by `principal`.
    pub(super) fn require_room_owner(
        &self,
        principal: &Principal,
        room: &Room,
    ) -> Result<(), EngineError> {
        require_role(principal, Role::Host)?;
        match self.properties.get(&room.property_id) {
            Some(p) if p.owner_id == principal.user_id => Ok(()),
            _ => Err(EngineError::Forbidden("not the owner of this room")),
        }
    }

    fn decision_note(&self, room: &Room, verdict: &str) -> String {
        let label = room.label.clone().unwrap_or_else(|| room.id.to_string());
        let property = self
            .properties
            .get(&room.property_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let note = format!("Your request for room {label} at {property} was {verdict}.");
        note.chars().take(MAX_NOTE_LEN).collect()
    }

    // ── Registries ───────────────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    ) -> Result<(), EngineError> {
        check_len(&name, MAX_NAME_LEN, "user name too long")?;
        check_len(&email, MAX_EMAIL_LEN, "email too long")?;
        let normalized = normalize_email(&email);
        if normalized.is_empty() || !normalized.contains('@') {
            return Err(EngineError::InvalidArgument("email must contain '@'"));
        }

        let _registry = self.registry_lock.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.emails.contains_key(&normalized) {
            return Err(EngineError::EmailTaken(email));
        }

        let event = Event::UserRegistered {
            id,
            name,
            email: email.trim().to_string(),
            role,
            at: dates::now(),
        };
        self.persist_global(&event).await?;
        info!(user = %id, role = role.as_str(), "user registered");
        Ok(())
    }

    pub async fn create_property(
        &self,
        principal: &Principal,
        id: Ulid,
        name: String,
        city: Option<String>,
    ) -> Result<(), EngineError> {
        require_role(principal, Role::Host)?;
        check_len(&name, MAX_NAME_LEN, "property name too long")?;
        if let Some(ref c) = city {
            check_len(c, MAX_NAME_LEN, "city name too long")?;
        }

        let _registry = self.registry_lock.lock().await;
        if self.properties.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::PropertyCreated {
            id,
            owner_id: principal.user_id,
            name,
            city,
        };
        self.persist_global(&event).await
    }

    /// Fields left as `None` keep their current value.
    pub async fn update_property(
        &self,
        principal: &Principal,
        id: Ulid,
        name: Option<String>,
        city: Option<String>,
    ) -> Result<(), EngineError> {
        require_role(principal, Role::Host)?;
        if let Some(ref n) = name {
            check_len(n, MAX_NAME_LEN, "property name too long")?;
        }
        if let Some(ref c) = city {
            check_len(c, MAX_NAME_LEN, "city name too long")?;
        }

        let _registry = self.registry_lock.lock().await;
        let property = self.get_property(&id).ok_or(EngineError::NotFound(id))?;
        if property.owner_id != principal.user_id {
            return Err(EngineError::Forbidden("not the owner of this property"));
        }
        let event = Event::PropertyUpdated {
            id,
            name: name.unwrap_or(property.name),
            city: city.or(property.city),
        };
        self.persist_global(&event).await?;
        info!(property = %id, "property updated");
        Ok(())
    }

    /// Change the caller's own display name and/or email. The new email must
    /// not belong to anyone else; the role is fixed at registration.
    pub async fn update_profile(
        &self,
        principal: &Principal,
        id: Ulid,
        name: Option<String>,
        email: Option<String>,
    ) -> Result<(), EngineError> {
        if id != principal.user_id {
            return Err(EngineError::Forbidden("only your own profile can be edited"));
        }
        if let Some(ref n) = name {
            check_len(n, MAX_NAME_LEN, "user name too long")?;
        }
        if let Some(ref e) = email {
            check_len(e, MAX_EMAIL_LEN, "email too long")?;
            if !normalize_email(e).contains('@') {
                return Err(EngineError::InvalidArgument("email must contain '@'"));
            }
        }

        let _registry = self.registry_lock.lock().await;
        let user = self.get_user(&id).ok_or(EngineError::NotFound(id))?;
        let email = match email {
            Some(e) => {
                let owner = self.emails.get(&normalize_email(&e)).map(|entry| *entry.value());
                if owner.is_some_and(|owner| owner != id) {
                    return Err(EngineError::EmailTaken(e));
                }
                e.trim().to_string()
            }
            None => user.email,
        };
        let event = Event::ProfileUpdated {
            id,
            name: name.unwrap_or(user.name),
            email,
        };
        self.persist_global(&event).await?;
        info!(user = %id, "profile updated");
        Ok(())
    }

    pub async fn create_room(
        &self,
        principal: &Principal,
        id: Ulid,
        property_id: Ulid,
        label: Option<String>,
        capacity: u32,
    ) -> Result<(), EngineError> {
        require_role(principal, Role::Host)?;
        check_capacity(capacity)?;
        if let Some(ref l) = label {
            check_len(l, MAX_LABEL_LEN, "room label too long")?;
        }

        let _registry = self.registry_lock.lock().await;
        match self.properties.get(&property_id) {
            None => return Err(EngineError::NotFound(property_id)),
            Some(p) if p.owner_id != principal.user_id => {
                return Err(EngineError::Forbidden("not the owner of this property"));
            }
            Some(_) => {}
        }
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::RoomCreated {
            id,
            property_id,
            label,
            capacity,
        };
        self.persist_global(&event).await?;
        info!(room = %id, property = %property_id, capacity, "room created");
        Ok(())
    }

    /// Fields left as `None` keep their current value.
    pub async fn update_room(
        &self,
        principal: &Principal,
        id: Ulid,
        label: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        if let Some(c) = capacity {
            check_capacity(c)?;
        }
        if let Some(ref l) = label {
            check_len(l, MAX_LABEL_LEN, "room label too long")?;
        }
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        self.require_room_owner(principal, &guard.room)?;

        let event = Event::RoomUpdated {
            id,
            label: label.or_else(|| guard.room.label.clone()),
            capacity: capacity.unwrap_or(guard.room.capacity),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn delete_room(&self, principal: &Principal, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        let rs = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        self.require_room_owner(principal, &guard.room)?;
        if guard.occupancies.iter().any(|o| o.is_committed()) {
            return Err(EngineError::HasOccupants(id));
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        self.unindex_room(&guard);
        drop(guard);
        self.rooms.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(room = %id, "room deleted");
        Ok(())
    }

    // ── Booking requests ─────────────────────────────────

    pub async fn submit_request(
        &self,
        principal: &Principal,
        id: Ulid,
        room_id: Ulid,
        move_in: Timestamp,
        months: u32,
    ) -> Result<(), EngineError> {
        require_role(principal, Role::Resident)?;
        validate_months(months)?;
        if dates::add_months(move_in, months).is_none() {
            return Err(EngineError::InvalidArgument("stay end out of range"));
        }
        if self.entity_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let mut guard = rs.write().await;
        if guard.record_count() >= MAX_RECORDS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many records on room"));
        }
        if guard.request(id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let created_at = dates::now();
        let event = Event::RequestSubmitted {
            id,
            room_id,
            resident_id: principal.user_id,
            move_in,
            months,
            created_at,
            expires_at: created_at + Duration::hours(REQUEST_TTL_HOURS),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(request = %id, room = %room_id, resident = %principal.user_id, months, "booking request submitted");
        Ok(())
    }

    /// Accept a pending request if the room has a free bed for the whole stay.
    /// Returns the id of the new occupancy.
    ///
    /// The room's write lock is held from reading its occupancies until the
    /// new occupancy is applied, so two approvals for one room cannot both
    /// take the last bed.
    pub async fn approve_request(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        self.require_room_owner(principal, &guard.room)?;
        let request = guard.request(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !request.is_pending() {
            return Err(EngineError::InvalidTransition {
                id,
                status: request.status.as_str(),
                expected: "pending",
            });
        }
        if guard.record_count() >= MAX_RECORDS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many records on room"));
        }

        let decision = evaluate_approval(&request, &guard.room, &guard.occupancies)?;
        if !decision.approved {
            metrics::counter!(APPROVALS_TOTAL, "outcome" => "rejected").increment(1);
            info!(request = %id, room = %request.room_id, conflicts = decision.conflicts.len(), "approval rejected: room full");
            return Err(EngineError::CapacityExceeded {
                capacity: guard.room.capacity,
                conflicts: decision.conflicts,
            });
        }

        let stay = requested_span(&request)?;
        let occupancy_id = Ulid::new();
        let event = Event::RequestAccepted {
            id,
            room_id: request.room_id,
            occupancy_id,
            joined_at: stay.start,
            exit_date: stay.end,
            active: stay.contains_instant(dates::now()),
            note: self.decision_note(&guard.room, "accepted"),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(APPROVALS_TOTAL, "outcome" => "approved").increment(1);
        info!(request = %id, occupancy = %occupancy_id, room = %request.room_id, "booking request approved");
        Ok(occupancy_id)
    }

    pub async fn decline_request(&self, principal: &Principal, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        self.require_room_owner(principal, &guard.room)?;
        let request = guard.request(id).ok_or(EngineError::NotFound(id))?;
        if !request.is_pending() {
            return Err(EngineError::InvalidTransition {
                id,
                status: request.status.as_str(),
                expected: "pending",
            });
        }
        let room_id = guard.room.id;
        let event = Event::RequestDeclined {
            id,
            room_id,
            note: self.decision_note(&guard.room, "declined"),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(request = %id, room = %room_id, "booking request declined");
        Ok(room_id)
    }

    pub async fn expire_request(&self, id: Ulid, now: Timestamp) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let request = guard.request(id).ok_or(EngineError::NotFound(id))?;
        if !request.is_pending() {
            return Err(EngineError::InvalidTransition {
                id,
                status: request.status.as_str(),
                expected: "pending",
            });
        }
        if request.expires_at > now {
            return Err(EngineError::InvalidArgument("request has not expired yet"));
        }
        let room_id = guard.room.id;
        let event = Event::RequestExpired { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    // ── Occupancies ──────────────────────────────────────

    /// Host marks a resident as moved out. The exit date is pulled in to now
    /// if the stay was booked to end later, but never before move-in.
    pub async fn record_departure(
        &self,
        principal: &Principal,
        occupancy_id: Ulid,
    ) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&occupancy_id).await?;
        self.require_room_owner(principal, &guard.room)?;
        let now = dates::now();
        let occupancy = guard
            .occupancies
            .iter()
            .find(|o| o.id == occupancy_id)
            .ok_or(EngineError::NotFound(occupancy_id))?;
        if !occupancy.is_committed() {
            return Err(EngineError::InvalidTransition {
                id: occupancy_id,
                status: occupancy.status.as_str(),
                expected: "accepted",
            });
        }
        // A stay that has not started yet ends on its move-in day.
        let mut exit_date = occupancy.exit_date.map_or(now, |exit| exit.min(now));
        if let Some(joined) = occupancy.joined_at {
            exit_date = exit_date.max(joined);
        }
        let room_id = guard.room.id;
        let event = Event::OccupancyEnded {
            id: occupancy_id,
            room_id,
            exit_date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(occupancy = %occupancy_id, room = %room_id, "departure recorded");
        Ok(room_id)
    }

    /// Move-in day has arrived for an accepted stay.
    pub async fn activate_occupancy(&self, id: Ulid, now: Timestamp) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let occupancy = guard
            .occupancies
            .iter()
            .find(|o| o.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if occupancy.is_active || occupancy.status != OccupancyStatus::Accepted {
            return Err(EngineError::InvalidTransition {
                id,
                status: if occupancy.is_active { "active" } else { occupancy.status.as_str() },
                expected: "accepted",
            });
        }
        if !occupancy.stay_span().is_some_and(|s| s.contains_instant(now)) {
            return Err(EngineError::InvalidArgument("stay is not in progress"));
        }
        let room_id = guard.room.id;
        let event = Event::OccupancyActivated { id, room_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    /// A committed stay whose exit date has passed. Covers stays that were
    /// never marked active, such as ones approved after their window closed
    /// or ones that ran entirely while no sweep was running.
    pub async fn end_occupancy(&self, id: Ulid, now: Timestamp) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let occupancy = guard
            .occupancies
            .iter()
            .find(|o| o.id == id)
            .ok_or(EngineError::NotFound(id))?;
        if !occupancy.is_committed() {
            return Err(EngineError::InvalidTransition {
                id,
                status: occupancy.status.as_str(),
                expected: "accepted",
            });
        }
        let Some(exit_date) = finished_exit(occupancy, now) else {
            return Err(EngineError::InvalidArgument("stay has not ended yet"));
        };
        let room_id = guard.room.id;
        let event = Event::OccupancyEnded {
            id,
            room_id,
            exit_date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(room_id)
    }

    // ── Guardian links ───────────────────────────────────

    pub async fn request_guardian_link(
        &self,
        principal: &Principal,
        id: Ulid,
        counterpart_id: Ulid,
    ) -> Result<(), EngineError> {
        let wanted = match principal.role {
            Role::Guardian => Role::Resident,
            Role::Resident => Role::Guardian,
            Role::Host => return Err(EngineError::Forbidden("guardian or resident role required")),
        };
        let counterpart = self
            .users
            .get(&counterpart_id)
            .map(|u| u.role)
            .ok_or(EngineError::NotFound(counterpart_id))?;
        if counterpart != wanted {
            return Err(EngineError::InvalidArgument(match wanted {
                Role::Resident => "counterpart must be a resident",
                _ => "counterpart must be a guardian",
            }));
        }
        let (guardian_id, resident_id) = match principal.role {
            Role::Guardian => (principal.user_id, counterpart_id),
            _ => (counterpart_id, principal.user_id),
        };

        let _registry = self.registry_lock.lock().await;
        if self.links.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let existing = self.links.iter().find_map(|l| {
            (l.links(guardian_id, resident_id) && l.status != LinkStatus::Declined).then_some(l.id)
        });
        if let Some(existing) = existing {
            return Err(EngineError::AlreadyExists(existing));
        }

        let event = Event::GuardianLinkRequested {
            id,
            guardian_id,
            resident_id,
            requested_by: principal.user_id,
            at: dates::now(),
        };
        self.persist_global(&event).await?;
        info!(link = %id, guardian = %guardian_id, resident = %resident_id, "guardian link requested");
        Ok(())
    }

    pub async fn respond_guardian_link(
        &self,
        principal: &Principal,
        id: Ulid,
        accept: bool,
    ) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        let (status, requested_by, involved) = self
            .links
            .get(&id)
            .map(|l| (l.status, l.requested_by, l.involves(principal.user_id)))
            .ok_or(EngineError::NotFound(id))?;
        if !involved || requested_by == principal.user_id {
            return Err(EngineError::Forbidden("only the invited party can respond"));
        }
        if status != LinkStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                status: status.as_str(),
                expected: "pending",
            });
        }
        let event = Event::GuardianLinkResponded {
            id,
            accepted: accept,
            at: dates::now(),
        };
        self.persist_global(&event).await?;
        info!(link = %id, accepted = accept, "guardian link answered");
        Ok(())
    }

    // ── Sweeps ───────────────────────────────────────────

    /// Pending requests whose time-to-live has run out.
    pub fn collect_expired_requests(&self, now: Timestamp) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.rooms.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for req in &guard.requests {
                    if req.is_pending() && req.expires_at <= now {
                        expired.push(req.id);
                    }
                }
            }
        }
        expired
    }

    /// Accepted stays whose move-in date has arrived but are not yet active.
    pub fn collect_due_move_ins(&self, now: Timestamp) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.rooms.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for o in &guard.occupancies {
                    if !o.is_active
                        && o.status == OccupancyStatus::Accepted
                        && o.stay_span().is_some_and(|s| s.contains_instant(now))
                    {
                        due.push(o.id);
                    }
                }
            }
        }
        due
    }

    /// Committed stays, active or not, whose exit date has passed.
    pub fn collect_due_move_outs(&self, now: Timestamp) -> Vec<Ulid> {
        let mut due = Vec::new();
        for entry in self.rooms.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for o in &guard.occupancies {
                    if finished_exit(o, now).is_some() {
                        due.push(o.id);
                    }
                }
            }
        }
        due
    }

    /// Recompute every room's cached availability flag. Returns how many flipped.
    pub async fn refresh_all_availability(&self, now: Timestamp) -> usize {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut changed = 0;
        for rs in rooms {
            let mut guard = rs.write().await;
            let before = guard.room.is_available;
            if super::refresh_availability(&mut guard, now) != before {
                changed += 1;
            }
        }
        changed
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    ///
    /// Holds the registry lock and a read lock on every room until the new
    /// file is in place, so no append can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;

        let mut events = Vec::new();
        for u in self.users.iter() {
            events.push(Event::UserRegistered {
                id: u.id,
                name: u.name.clone(),
                email: u.email.clone(),
                role: u.role,
                at: u.registered_at,
            });
        }
        for p in self.properties.iter() {
            events.push(Event::PropertyCreated {
                id: p.id,
                owner_id: p.owner_id,
                name: p.name.clone(),
                city: p.city.clone(),
            });
        }

        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(rooms.len());
        for rs in rooms {
            guards.push(rs.read_owned().await);
        }
        for guard in &guards {
            emit_room(guard, &mut events);
        }

        for l in self.links.iter() {
            events.push(Event::GuardianLinkRequested {
                id: l.id,
                guardian_id: l.guardian_id,
                resident_id: l.resident_id,
                requested_by: l.requested_by,
                at: l.requested_at,
            });
            if let Some(at) = l.responded_at {
                events.push(Event::GuardianLinkResponded {
                    id: l.id,
                    accepted: l.status == LinkStatus::Accepted,
                    at,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
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

/// Events recreating one room: creation, then each request with its outcome,
/// then departures.
fn emit_room(rs: &RoomState, events: &mut Vec<Event>) {
    let room_id = rs.room.id;
    events.push(Event::RoomCreated {
        id: room_id,
        property_id: rs.room.property_id,
        label: rs.room.label.clone(),
        capacity: rs.room.capacity,
    });

    for req in &rs.requests {
        events.push(Event::RequestSubmitted {
            id: req.id,
            room_id,
            resident_id: req.resident_id,
            move_in: req.move_in,
            months: req.months,
            created_at: req.created_at,
            expires_at: req.expires_at,
        });
        let note = req.note.clone().unwrap_or_default();
        match req.status {
            BookingStatus::Pending => {}
            BookingStatus::Declined => events.push(Event::RequestDeclined {
                id: req.id,
                room_id,
                note,
            }),
            BookingStatus::Expired => events.push(Event::RequestExpired { id: req.id, room_id }),
            BookingStatus::Accepted => {
                let Some(o) = rs.occupancies.iter().find(|o| o.request_id == Some(req.id)) else {
                    continue;
                };
                let (Some(joined_at), Some(exit_date)) = (o.joined_at, o.exit_date) else {
                    continue;
                };
                events.push(Event::RequestAccepted {
                    id: req.id,
                    room_id,
                    occupancy_id: o.id,
                    joined_at,
                    exit_date,
                    active: o.is_active,
                    note,
                });
            }
        }
    }

    for o in &rs.occupancies {
        if o.status == OccupancyStatus::Left
            && let Some(exit_date) = o.exit_date
        {
            events.push(Event::OccupancyEnded {
                id: o.id,
                room_id,
                exit_date,
            });
        }
    }
}
