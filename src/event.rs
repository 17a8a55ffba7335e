use std::any::Any;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::time::Instant;

use slab::Slab;

use crate::flags::EventFlags;

/// Not `Send`: callbacks (session read/write handlers, timers) routinely
/// close over `Rc`-based state that only ever lives on the cycle thread.
/// Registering one is therefore always a same-thread operation; crossing
/// threads goes through `Cycle::run_in_cycle`/`queue_in_cycle` instead,
/// which carry plain `Send` data rather than a registered callback.
pub type EventCallback = Box<dyn FnMut(EventId, EventFlags, Instant)>;

/// Opaque handle into a cycle's event table.
///
/// The low 32 bits are the slab slot index, the high 32 bits are a
/// generation counter bumped every time the slot is reused — stale handles
/// from a removed event compare unequal to whatever replaces that slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct EventId(u64);

impl EventId {
    pub(crate) fn new(index: usize, generation: u32) -> EventId {
        EventId(((generation as u64) << 32) | index as u64)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn to_raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> EventId {
        EventId(raw)
    }
}

pub(crate) struct EventSlot {
    pub fd: RawFd,
    pub flags: EventFlags,
    pub timeval: i64,
    pub callback: EventCallback,
    pub tie: Option<Weak<dyn Any>>,
    pub generation: u32,
}

/// Generation-checked slab of event slots, owned by a single `Cycle`.
///
/// Replaces the shared_ptr/weak_ptr "tie" table of the source system: since
/// a `Cycle` never hands events across threads, there's no need for atomic
/// refcounting, just a plain arena with stale-handle detection.
#[derive(Default)]
pub(crate) struct EventTable {
    slots: Slab<EventSlot>,
    generations: Vec<u32>,
}

impl EventTable {
    pub fn new() -> EventTable {
        EventTable {
            slots: Slab::new(),
            generations: Vec::new(),
        }
    }

    pub fn insert(
        &mut self,
        fd: RawFd,
        flags: EventFlags,
        timeval: i64,
        callback: EventCallback,
    ) -> EventId {
        let index = self.slots.vacant_key();
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        let generation = self.generations[index];
        let key = self.slots.insert(EventSlot {
            fd,
            flags,
            timeval,
            callback,
            tie: None,
            generation,
        });
        debug_assert_eq!(key, index);
        EventId::new(index, generation)
    }

    pub fn get(&self, id: EventId) -> Option<&EventSlot> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
    }

    pub fn get_mut(&mut self, id: EventId) -> Option<&mut EventSlot> {
        let generation = id.generation();
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == generation)
    }

    pub fn remove(&mut self, id: EventId) -> Option<EventSlot> {
        if self.get(id).is_none() {
            return None;
        }
        let index = id.index();
        let slot = self.slots.remove(index);
        self.generations[index] = self.generations[index].wrapping_add(1);
        Some(slot)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EventId, &EventSlot)> {
        self.slots
            .iter()
            .map(|(index, slot)| (EventId::new(index, slot.generation), slot))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.generations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> EventCallback {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn stale_id_rejected_after_remove_and_reuse() {
        let mut table = EventTable::new();
        let a = table.insert(3, EventFlags::read(), 0, noop_callback());
        table.remove(a).unwrap();

        let b = table.insert(3, EventFlags::write(), 0, noop_callback());
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }

    #[test]
    fn insert_get_roundtrip() {
        let mut table = EventTable::new();
        let id = table.insert(7, EventFlags::read(), 0, noop_callback());
        assert_eq!(table.get(id).unwrap().fd, 7);
        assert!(table.contains(id));
    }
}
