mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{availability_info, committed_counts, recompute_availability, roster, stay_status};
pub use conflict::{Decision, evaluate_approval};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::dates;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends into the batch.
/// 3. Single flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so a half-written batch is not carried
    // into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// The booking workflow. Room-scoped data (requests, occupancies, the cached
/// availability flag) lives behind one lock per room; every decision that
/// reads occupancies and then writes is made while holding that room's write
/// lock, so approvals for the same room are serialized.
pub struct Engine {
    pub rooms: DashMap<Ulid, SharedRoomState>,
    pub users: DashMap<Ulid, User>,
    pub properties: DashMap<Ulid, Property>,
    pub links: DashMap<Ulid, GuardianLink>,
    pub notify: Arc<NotifyHub>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: request/occupancy id → room id
    pub(super) entity_to_room: DashMap<Ulid, Ulid>,
    pub(super) property_rooms: DashMap<Ulid, Vec<Ulid>>,
    /// Resident → rooms they have requested or stayed in.
    pub(super) resident_rooms: DashMap<Ulid, Vec<Ulid>>,
    /// Normalized email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Serializes check-then-write outside room locks (users, properties,
    /// room creation/deletion, guardian links) and compaction snapshots.
    /// Taken before any room lock.
    pub(super) registry_lock: Mutex<()>,
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            properties: DashMap::new(),
            links: DashMap::new(),
            notify,
            wal_tx,
            entity_to_room: DashMap::new(),
            property_rooms: DashMap::new(),
            resident_rooms: DashMap::new(),
            emails: DashMap::new(),
            registry_lock: Mutex::new(()),
        };

        // We are the sole owner of every room Arc here, so try_write always
        // succeeds. Never block: this may run inside an async context.
        for event in &events {
            match event.room_id() {
                Some(room_id) => {
                    if let Some(entry) = engine.rooms.get(&room_id) {
                        let rs = entry.value().clone();
                        drop(entry);
                        let Ok(mut guard) = rs.try_write() else { continue };
                        engine.apply_to_room(&mut guard, event);
                    }
                }
                None => engine.apply_global(event),
            }
        }

        let now = dates::now();
        for entry in engine.rooms.iter() {
            if let Ok(mut guard) = entry.value().try_write() {
                refresh_availability(&mut guard, now);
            }
        }

        tracing::info!(
            events = events.len(),
            users = engine.users.len(),
            rooms = engine.rooms.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_room.get(entity_id).map(|e| *e.value())
    }

    pub fn principal_for(&self, user_id: &Ulid) -> Option<Principal> {
        self.users.get(user_id).map(|u| u.principal())
    }

    /// WAL-append + apply + refresh availability + notify, under the caller's room lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_room(rs, event);
        refresh_availability(rs, dates::now());
        self.notify.send(rs.room.id, event);
        Ok(())
    }

    /// WAL-append + apply for events not covered by a room lock.
    pub(super) async fn persist_global(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_global(event);
        match event {
            Event::RoomCreated { id, .. } | Event::RoomDeleted { id } => self.notify.send(*id, event),
            _ => {}
        }
        Ok(())
    }

    /// Lookup entity → room, get room, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let room_id = self
            .get_room_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
        Ok(rs.write_owned().await)
    }

    /// Apply a room-scoped event (caller holds the room's write lock).
    fn apply_to_room(&self, rs: &mut RoomState, event: &Event) {
        let room_id = rs.room.id;
        match event {
            Event::RoomUpdated { label, capacity, .. } => {
                rs.room.label = label.clone();
                rs.room.capacity = *capacity;
            }
            Event::RequestSubmitted {
                id,
                resident_id,
                move_in,
                months,
                created_at,
                expires_at,
                ..
            } => {
                rs.requests.push(BookingRequest {
                    id: *id,
                    room_id,
                    resident_id: *resident_id,
                    move_in: *move_in,
                    months: *months,
                    status: BookingStatus::Pending,
                    created_at: *created_at,
                    expires_at: *expires_at,
                    note: None,
                });
                self.entity_to_room.insert(*id, room_id);
                self.index_resident(*resident_id, room_id);
            }
            Event::RequestAccepted {
                id,
                occupancy_id,
                joined_at,
                exit_date,
                active,
                note,
                ..
            } => {
                let Some(req) = rs.request_mut(*id) else { return };
                req.status = BookingStatus::Accepted;
                req.note = Some(note.clone());
                let resident_id = req.resident_id;
                let requested_at = req.created_at;

                rs.insert_occupancy(Occupancy {
                    id: *occupancy_id,
                    room_id,
                    user_id: resident_id,
                    request_id: Some(*id),
                    requested_at,
                    joined_at: Some(*joined_at),
                    exit_date: Some(*exit_date),
                    is_active: *active,
                    status: OccupancyStatus::Accepted,
                });
                self.entity_to_room.insert(*occupancy_id, room_id);
                self.index_resident(resident_id, room_id);
            }
            Event::RequestDeclined { id, note, .. } => {
                if let Some(req) = rs.request_mut(*id) {
                    req.status = BookingStatus::Declined;
                    req.note = Some(note.clone());
                }
            }
            Event::RequestExpired { id, .. } => {
                if let Some(req) = rs.request_mut(*id) {
                    req.status = BookingStatus::Expired;
                }
            }
            Event::OccupancyActivated { id, .. } => {
                if let Some(o) = rs.occupancy_mut(*id) {
                    o.is_active = true;
                }
            }
            Event::OccupancyEnded { id, exit_date, .. } => {
                if let Some(o) = rs.occupancy_mut(*id) {
                    o.is_active = false;
                    o.status = OccupancyStatus::Left;
                    o.exit_date = Some(*exit_date);
                }
            }
            _ => {}
        }
    }

    /// Apply an event that touches the registries rather than a room's contents.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                name,
                email,
                role,
                at,
            } => {
                self.emails.insert(normalize_email(email), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        role: *role,
                        registered_at: *at,
                    },
                );
            }
            Event::PropertyCreated {
                id,
                owner_id,
                name,
                city,
            } => {
                self.properties.insert(
                    *id,
                    Property {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                        city: city.clone(),
                    },
                );
            }
            Event::RoomCreated {
                id,
                property_id,
                label,
                capacity,
            } => {
                let rs = RoomState::new(*id, *property_id, label.clone(), *capacity);
                self.rooms.insert(*id, Arc::new(RwLock::new(rs)));
                self.property_rooms.entry(*property_id).or_default().push(*id);
            }
            Event::RoomDeleted { id } => {
                if let Some((_, rs)) = self.rooms.remove(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.unindex_room(&guard);
                }
            }
            Event::GuardianLinkRequested {
                id,
                guardian_id,
                resident_id,
                requested_by,
                at,
            } => {
                self.links.insert(
                    *id,
                    GuardianLink {
                        id: *id,
                        guardian_id: *guardian_id,
                        resident_id: *resident_id,
                        requested_by: *requested_by,
                        status: LinkStatus::Pending,
                        requested_at: *at,
                        responded_at: None,
                    },
                );
            }
            Event::GuardianLinkResponded { id, accepted, at } => {
                if let Some(mut link) = self.links.get_mut(id) {
                    link.status = if *accepted {
                        LinkStatus::Accepted
                    } else {
                        LinkStatus::Declined
                    };
                    link.responded_at = Some(*at);
                }
            }
            Event::PropertyUpdated { id, name, city } => {
                if let Some(mut p) = self.properties.get_mut(id) {
                    p.name = name.clone();
                    p.city = city.clone();
                }
            }
            Event::ProfileUpdated { id, name, email } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    self.emails.remove(&normalize_email(&user.email));
                    self.emails.insert(normalize_email(email), *id);
                    user.name = name.clone();
                    user.email = email.clone();
                }
            }
            _ => {}
        }
    }

    fn index_resident(&self, resident_id: Ulid, room_id: Ulid) {
        let mut rooms = self.resident_rooms.entry(resident_id).or_default();
        if !rooms.contains(&room_id) {
            rooms.push(room_id);
        }
    }

    /// Drop every index entry pointing at a room that is going away.
    fn unindex_room(&self, rs: &RoomState) {
        let room_id = rs.room.id;
        if let Some(mut rooms) = self.property_rooms.get_mut(&rs.room.property_id) {
            rooms.retain(|r| *r != room_id);
        }
        for req in &rs.requests {
            self.entity_to_room.remove(&req.id);
            if let Some(mut rooms) = self.resident_rooms.get_mut(&req.resident_id) {
                rooms.retain(|r| *r != room_id);
            }
        }
        for o in &rs.occupancies {
            self.entity_to_room.remove(&o.id);
        }
    }
}

/// Store the recalculated availability flag on the room.
pub(crate) fn refresh_availability(rs: &mut RoomState, now: Timestamp) -> bool {
    let available = recompute_availability(&rs.room, &rs.occupancies, now);
    rs.room.is_available = available;
    available
}
