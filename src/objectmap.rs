//! Two-phase map from native heap ids to dense object ids.
//!
//! Only the low 36 bits of a heap id are significant, which handles heaps
//! up to 68G. The high 20 bits select one of 2^20 lazily allocated slots;
//! each slot maps the low 16 bits. During the parse, slots just append to
//! two parallel lists (no hashing in the hot path); a parallel finalize
//! pass then converts each slot to a hash map and drops the lists.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::error::HeapError;
use crate::{HeapId, ObjectId};

const MAX_HEAP_BITS: u32 = 36;

/// Largest representable heap id.
pub const MAX_HEAP_ID: HeapId = (1 << MAX_HEAP_BITS) - 1;

const NUM_SLOTS: usize = 1 << (MAX_HEAP_BITS - 16);

#[derive(Default, Debug)]
struct Slot {
    // insert phase
    low_hids: Vec<u16>,
    oids: Vec<ObjectId>,
    // lookup phase
    mapping: HashMap<u16, ObjectId>,
}

impl Slot {
    fn finalize(&mut self) {
        let mut mapping = HashMap::with_capacity(self.low_hids.len());
        for (&low, &oid) in self.low_hids.iter().zip(&self.oids) {
            mapping.insert(low, oid);
        }
        self.mapping = mapping;
        self.low_hids = Vec::new();
        self.oids = Vec::new();
    }
}

#[derive(Debug)]
pub struct ObjectMap {
    slots: Vec<Option<Box<Slot>>>,
}

impl ObjectMap {
    pub fn new() -> ObjectMap {
        let mut slots = Vec::new();
        slots.resize_with(NUM_SLOTS, || None);
        ObjectMap { slots }
    }

    /// Record a heap id / object id pair. O(1), no hashing.
    pub fn add(&mut self, hid: HeapId, oid: ObjectId) -> Result<(), HeapError> {
        if hid > MAX_HEAP_ID {
            return Err(HeapError::HidOutOfRange(hid));
        }
        let slot = self.slots[(hid >> 16) as usize].get_or_insert_with(Default::default);
        slot.low_hids.push((hid & 0xFFFF) as u16);
        slot.oids.push(oid);
        Ok(())
    }

    /// Convert every slot's insert lists into its lookup map, in parallel.
    /// Must run before [`ObjectMap::get`]; inserts after this are not
    /// supported.
    pub fn finalize(&mut self) {
        self.slots.par_iter_mut().for_each(|slot| {
            if let Some(slot) = slot {
                slot.finalize();
            }
        });
    }

    /// Look up an object id, or 0 if the heap id was never recorded.
    pub fn get(&self, hid: HeapId) -> ObjectId {
        match &self.slots[(hid >> 16) as usize] {
            Some(slot) => slot
                .mapping
                .get(&((hid & 0xFFFF) as u16))
                .copied()
                .unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for ObjectMap {
    fn default() -> Self {
        ObjectMap::new()
    }
}
