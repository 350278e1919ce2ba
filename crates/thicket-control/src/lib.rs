//! Controller lifecycle glue.
//!
//! Sits between applications and broker processes: spawns a
//! `thicket-controller` when the requested controller id has no broker yet,
//! validates id ranges before anything touches the system, and tracks live
//! attachments in a fixed-capacity [`Registry`] so the hot path can resolve
//! a slot to its state without holding a lock.

use std::io;
use std::process::{Child, Command};
use std::sync::Arc;

use parking_lot::Mutex;

use thicket_primitives::{MAX_CONTROLLER_ID, MAX_QUEUE_ID};

/// Installed location of the broker binary.
pub const CONTROLLER_BIN: &str = "/usr/bin/thicket-controller";

// ============================================================================
// Spawning
// ============================================================================

/// Launch a broker for `controller_id` from the installed binary.
pub fn spawn_controller(controller_id: u32) -> Result<Child, ControlError> {
    spawn_controller_at(CONTROLLER_BIN, controller_id)
}

/// Launch a broker for `controller_id` from `bin`. The id is validated
/// before any process activity.
pub fn spawn_controller_at(bin: &str, controller_id: u32) -> Result<Child, ControlError> {
    if controller_id > MAX_CONTROLLER_ID {
        return Err(ControlError::InvalidArgument("controller id out of range"));
    }
    match Command::new(bin)
        .arg("-c")
        .arg(controller_id.to_string())
        .spawn()
    {
        Ok(child) => {
            tracing::info!(controller_id, pid = child.id(), "controller spawned");
            Ok(child)
        }
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound {
                tracing::error!(bin, "controller binary not found; is thicket installed?");
            }
            Err(ControlError::Spawn(e))
        }
    }
}

/// Check an `(controller, queue)` pair before it reaches hardware plumbing.
pub fn validate_attachment(controller_id: u32, queue_id: u32) -> Result<(), ControlError> {
    if controller_id > MAX_CONTROLLER_ID {
        return Err(ControlError::InvalidArgument("controller id out of range"));
    }
    if queue_id > MAX_QUEUE_ID {
        return Err(ControlError::InvalidArgument("queue id out of range"));
    }
    Ok(())
}

/// Hook through which an attachment reaches the underlying transport: given
/// a validated controller id, hardware queue, and logical queue id, wire the
/// three together. Implementations own whatever device-specific plumbing
/// that takes.
pub trait QueueBinder {
    fn attach(
        &mut self,
        controller_id: u32,
        hw_queue: u32,
        queue_id: u32,
    ) -> Result<(), ControlError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Fixed-capacity slot table of live attachments.
///
/// The lock guards only slot assignment and removal; `get` clones the `Arc`
/// out, so readers on the traffic path hold the lock for a pointer copy and
/// nothing longer.
pub struct Registry<T> {
    slots: Mutex<Box<[Option<Arc<T>>]>>,
}

impl<T> Registry<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots.into_boxed_slice()),
        }
    }

    /// Claim `slot` for `value`. Fails if the slot is out of range or
    /// already taken.
    pub fn insert(&self, slot: usize, value: Arc<T>) -> Result<(), ControlError> {
        let mut slots = self.slots.lock();
        match slots.get_mut(slot) {
            None => Err(ControlError::InvalidArgument("slot out of range")),
            Some(entry @ None) => {
                *entry = Some(value);
                Ok(())
            }
            Some(Some(_)) => Err(ControlError::SlotOccupied(slot)),
        }
    }

    /// Vacate `slot`, returning what lived there.
    pub fn remove(&self, slot: usize) -> Option<Arc<T>> {
        self.slots.lock().get_mut(slot)?.take()
    }

    /// Resolve `slot` to its occupant.
    pub fn get(&self, slot: usize) -> Option<Arc<T>> {
        self.slots.lock().get(slot)?.clone()
    }

    /// Occupied slot count.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ControlError {
    InvalidArgument(&'static str),
    Spawn(io::Error),
    SlotOccupied(usize),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ControlError::Spawn(e) => write!(f, "failed to spawn controller: {e}"),
            ControlError::SlotOccupied(slot) => write!(f, "slot {slot} already occupied"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_ids_rejected_before_spawning() {
        // An invalid id must fail fast, not reach for the binary.
        let err = spawn_controller_at("/nonexistent/never-run", MAX_CONTROLLER_ID + 1).unwrap_err();
        assert!(matches!(err, ControlError::InvalidArgument(_)));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = spawn_controller_at("/nonexistent/never-run", 0).unwrap_err();
        assert!(matches!(err, ControlError::Spawn(_)));
    }

    #[test]
    fn attachment_validation() {
        validate_attachment(0, 0).unwrap();
        validate_attachment(MAX_CONTROLLER_ID, MAX_QUEUE_ID).unwrap();
        assert!(validate_attachment(MAX_CONTROLLER_ID + 1, 0).is_err());
        assert!(validate_attachment(0, MAX_QUEUE_ID + 1).is_err());
    }

    #[test]
    fn registry_slot_lifecycle() {
        let registry = Registry::new(4);
        assert!(registry.is_empty());

        registry.insert(1, Arc::new("a")).unwrap();
        assert!(matches!(
            registry.insert(1, Arc::new("b")),
            Err(ControlError::SlotOccupied(1))
        ));
        assert!(matches!(
            registry.insert(4, Arc::new("c")),
            Err(ControlError::InvalidArgument(_))
        ));

        assert_eq!(*registry.get(1).unwrap(), "a");
        assert_eq!(registry.len(), 1);

        assert_eq!(*registry.remove(1).unwrap(), "a");
        assert!(registry.get(1).is_none());
        assert!(registry.remove(1).is_none());
    }
}
