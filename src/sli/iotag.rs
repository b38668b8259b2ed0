//! Iotag allocation and the in-flight lookup table.

use std::collections::HashSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TagSlot {
    Free,
    /// Assigned, descriptor still waiting in a transmit queue.
    Reserved,
    /// Descriptor is on the completion list of `ring` under slab `key`.
    InFlight { ring: usize, key: usize },
}

/// Hands out iotags and remembers where in-flight descriptors live.
///
/// With a bounded tag space every tag has a table slot and completions are
/// matched in O(1). Without one, tags come from a wrapping counter and the
/// ring falls back to scanning its completion list.
#[derive(Debug)]
pub(crate) enum IotagTable {
    Indexed { slots: Vec<TagSlot>, next: u16 },
    Linear { in_use: HashSet<u16>, next: u16 },
}

impl IotagTable {
    pub(crate) fn new(max_iotags: Option<u16>) -> Self {
        match max_iotags {
            // Tag 0 is never handed out, slot 0 stays unused.
            Some(max) => IotagTable::Indexed {
                slots: vec![TagSlot::Free; max as usize + 1],
                next: 1,
            },
            None => IotagTable::Linear {
                in_use: HashSet::new(),
                next: 1,
            },
        }
    }

    /// Next free tag after the last one handed out, or `None` when every tag
    /// is taken.
    pub(crate) fn alloc(&mut self) -> Option<u16> {
        match self {
            IotagTable::Indexed { slots, next } => {
                let max = slots.len() - 1;
                for step in 0..max {
                    let tag = (*next as usize - 1 + step) % max + 1;
                    if slots[tag] == TagSlot::Free {
                        slots[tag] = TagSlot::Reserved;
                        *next = (tag % max + 1) as u16;
                        return Some(tag as u16);
                    }
                }
                None
            }
            IotagTable::Linear { in_use, next } => {
                if in_use.len() >= u16::MAX as usize {
                    return None;
                }
                loop {
                    let tag = *next;
                    *next = if tag == u16::MAX { 1 } else { tag + 1 };
                    if in_use.insert(tag) {
                        return Some(tag);
                    }
                }
            }
        }
    }

    pub(crate) fn mark_in_flight(&mut self, tag: u16, ring: usize, key: usize) {
        if let IotagTable::Indexed { slots, .. } = self {
            if let Some(slot) = slots.get_mut(tag as usize) {
                *slot = TagSlot::InFlight { ring, key };
            }
        }
    }

    /// Where the descriptor with `tag` lives. `None` either means the tag is
    /// not in flight or, for tags the table does not cover, that the caller has
    /// to scan.
    pub(crate) fn locate(&self, tag: u16) -> Lookup {
        match self {
            IotagTable::Indexed { slots, .. } => match slots.get(tag as usize) {
                Some(TagSlot::InFlight { ring, key }) if tag != 0 => Lookup::Found {
                    ring: *ring,
                    key: *key,
                },
                Some(_) if tag != 0 => Lookup::NotInFlight,
                _ => Lookup::Scan,
            },
            IotagTable::Linear { .. } => Lookup::Scan,
        }
    }

    pub(crate) fn free(&mut self, tag: u16) {
        match self {
            IotagTable::Indexed { slots, .. } => {
                if tag != 0 {
                    if let Some(slot) = slots.get_mut(tag as usize) {
                        *slot = TagSlot::Free;
                    }
                }
            }
            IotagTable::Linear { in_use, .. } => {
                in_use.remove(&tag);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            IotagTable::Indexed { slots, next } => {
                slots.fill(TagSlot::Free);
                *next = 1;
            }
            IotagTable::Linear { in_use, next } => {
                in_use.clear();
                *next = 1;
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    Found { ring: usize, key: usize },
    NotInFlight,
    Scan,
}
