use std::collections::{BTreeSet, HashMap};

use log::trace;

use super::CompatDescriptor;

/// Table of (file) descriptors. Typically owned by a Process. Each occupied
/// index holds the single owning compat-descriptor slot for that fd.
pub struct DescriptorTable {
    descriptors: HashMap<u32, CompatDescriptor>,

    // Indices less than `next_index` known to be available.
    available_indices: BTreeSet<u32>,

    // Lowest index not in `available_indices` that *might* be available. We
    // still need to verify availability in `descriptors`, though.
    next_index: u32,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            descriptors: HashMap::new(),
            available_indices: BTreeSet::new(),
            next_index: 0,
        }
    }

    /// Register the descriptor at the lowest unused index, and return the
    /// index.
    pub fn register_descriptor(&mut self, mut descriptor: CompatDescriptor) -> u32 {
        let idx = if let Some(idx) = self.available_indices.iter().next() {
            // Un-borrow from `available_indices`.
            let idx = *idx;
            // Take from `available_indices`
            trace!("Reusing available index {}", idx);
            self.available_indices.remove(&idx);
            idx
        } else {
            // Skip past any indexes that are in use. This can happen after
            // calling `register_descriptor_with_fd` with a value greater than
            // `next_index`.
            while self.descriptors.contains_key(&self.next_index) {
                trace!("Skipping past in-use index {}", self.next_index);
                self.next_index += 1;
            }
            // Take the next index.
            let idx = self.next_index;
            trace!("Using index {}", idx);
            self.next_index += 1;
            idx
        };

        descriptor.set_handle(Some(idx));
        let prev = self.descriptors.insert(idx, descriptor);
        debug_assert!(prev.is_none(), "Already a descriptor at {}", idx);

        idx
    }

    // Call after inserting to `available_indices`, to free any that are
    // contiguous with `next_index`.
    fn trim_tail(&mut self) {
        loop {
            let last_in_available = match self.available_indices.iter().next_back() {
                Some(i) => *i,
                None => break,
            };
            if (last_in_available + 1) == self.next_index {
                // Last entry in available_indices is adjacent to next_index.
                // We can merge them, freeing an entry in `available_indices`.
                self.next_index -= 1;
                self.available_indices.remove(&last_in_available);
            } else {
                break;
            }
        }
    }

    /// Deregister the descriptor at the given index and return it.
    pub fn deregister_descriptor(&mut self, idx: u32) -> Option<CompatDescriptor> {
        let mut maybe_descriptor = self.descriptors.remove(&idx);
        self.available_indices.insert(idx);
        self.trim_tail();
        if let Some(descriptor) = &mut maybe_descriptor {
            descriptor.set_handle(None);
        }
        maybe_descriptor
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get(&self, idx: u32) -> Option<&CompatDescriptor> {
        self.descriptors.get(&idx)
    }

    /// Get the descriptor at `idx` mutably, if any.
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut CompatDescriptor> {
        self.descriptors.get_mut(&idx)
    }

    /// Register a descriptor at `index`. If a descriptor is already present
    /// at that index, it is deregistered from that index and returned.
    pub fn register_descriptor_with_fd(
        &mut self,
        mut descriptor: CompatDescriptor,
        index: u32,
    ) -> Option<CompatDescriptor> {
        descriptor.set_handle(Some(index));

        // We ensure the index is no longer in `self.available_indices`. We
        // *don't* ensure `self.next_index` is > `index`, since that'd require
        // adding the indices in between to `self.available_indices`. It uses
        // less memory and is no more expensive to iterate when *using*
        // `self.available_indices` instead.
        self.available_indices.remove(&index);

        if let Some(mut prev) = self.descriptors.insert(index, descriptor) {
            trace!("Overwriting index {}", index);
            prev.set_handle(None);
            Some(prev)
        } else {
            trace!("Setting to unused index {}", index);
            None
        }
    }

    /// Remove and return all descriptors, e.g. for process teardown.
    pub fn remove_all(&mut self) -> impl Iterator<Item = CompatDescriptor> {
        self.available_indices.clear();
        self.next_index = 0;
        let descriptors = std::mem::take(&mut self.descriptors);
        descriptors.into_values()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::descriptor::{LegacyFile, LegacyFileKind, OwnedLegacyFile};

    fn new_legacy_descriptor() -> CompatDescriptor {
        CompatDescriptor::from_legacy(OwnedLegacyFile::new(LegacyFile::new(LegacyFileKind::File)))
    }

    #[test]
    fn test_lowest_index_reuse() {
        let mut table = DescriptorTable::new();
        assert_eq!(table.register_descriptor(new_legacy_descriptor()), 0);
        assert_eq!(table.register_descriptor(new_legacy_descriptor()), 1);
        assert_eq!(table.register_descriptor(new_legacy_descriptor()), 2);

        table.deregister_descriptor(1).unwrap();
        assert!(table.get(1).is_none());

        // the lowest available index is reused first
        assert_eq!(table.register_descriptor(new_legacy_descriptor()), 1);
        assert_eq!(table.register_descriptor(new_legacy_descriptor()), 3);
    }

    #[test]
    fn test_register_with_fd_replaces() {
        let mut table = DescriptorTable::new();
        let fd = table.register_descriptor(new_legacy_descriptor());

        let replaced = table.register_descriptor_with_fd(new_legacy_descriptor(), fd);
        assert!(replaced.is_some());
        // the replaced descriptor's handle was cleared
        assert_eq!(replaced.unwrap().as_legacy().unwrap().handle(), None);

        // registering past the end leaves a hole that is later filled
        assert!(table
            .register_descriptor_with_fd(new_legacy_descriptor(), 10)
            .is_none());
        assert_eq!(table.register_descriptor(new_legacy_descriptor()), 1);
    }

    #[test]
    fn test_handle_bookkeeping() {
        let mut table = DescriptorTable::new();
        let fd = table.register_descriptor(new_legacy_descriptor());
        assert_eq!(table.get(fd).unwrap().as_legacy().unwrap().handle(), Some(fd));

        let desc = table.deregister_descriptor(fd).unwrap();
        assert_eq!(desc.as_legacy().unwrap().handle(), None);
    }
}
