use ulid::Ulid;

use crate::dates::format_timestamp;
use crate::model::Occupancy;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    EmailTaken(String),
    /// Caller is anonymous, has the wrong role, or does not own the room.
    Forbidden(&'static str),
    InvalidArgument(&'static str),
    /// `id` is in `status`; the operation needs it to be in `expected`.
    InvalidTransition {
        id: Ulid,
        status: &'static str,
        expected: &'static str,
    },
    CapacityExceeded {
        capacity: u32,
        conflicts: Vec<Occupancy>,
    },
    HasOccupants(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EmailTaken(email) => write!(f, "email already registered: {email}"),
            EngineError::Forbidden(msg) => write!(f, "permission denied: {msg}"),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::InvalidTransition {
                id,
                status,
                expected,
            } => write!(f, "{id} is {status}, expected {expected}"),
            EngineError::CapacityExceeded {
                capacity,
                conflicts,
            } => {
                write!(f, "capacity {capacity} exceeded for the requested stay")?;
                if !conflicts.is_empty() {
                    write!(f, "; overlapping stays:")?;
                    for (i, o) in conflicts.iter().enumerate() {
                        let sep = if i == 0 { " " } else { ", " };
                        let joined = o.joined_at.map(format_timestamp).unwrap_or_default();
                        let exit = o
                            .stay_span()
                            .map(|s| format_timestamp(s.end))
                            .unwrap_or_default();
                        write!(f, "{sep}{} [{joined}, {exit})", o.user_id)?;
                    }
                }
                Ok(())
            }
            EngineError::HasOccupants(id) => {
                write!(f, "cannot delete room {id}: has committed occupants")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
