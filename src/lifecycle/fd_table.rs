//! Listen address to inherited descriptor offset table.
//!
//! Descriptor inheritance is positional: the i-th address in the list is
//! served by the descriptor at `FIRST_INHERITED_FD + i` in a restarted child.
//! The parent and the child both derive offsets from the same ordered list,
//! so there is nothing to negotiate at runtime.

use std::collections::HashMap;
use std::os::fd::RawFd;

/// First descriptor slot after stdin, stdout and stderr.
pub const FIRST_INHERITED_FD: RawFd = 3;

/// Ordered mapping from listen address to descriptor offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdOffsetTable {
    entries: Vec<(String, usize)>,
}

impl FdOffsetTable {
    /// Assign offset `i` to the i-th address, zero-based.
    ///
    /// Duplicates get their own sequential offsets. Lookups by address
    /// return the first occurrence.
    pub fn build<S: AsRef<str>>(addrs: &[S]) -> Self {
        let entries = addrs
            .iter()
            .enumerate()
            .map(|(offset, addr)| (addr.as_ref().to_string(), offset))
            .collect();
        Self { entries }
    }

    /// Offset for an address.
    pub fn offset(&self, addr: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|(a, _)| a == addr)
            .map(|(_, offset)| *offset)
    }

    /// Descriptor number the listener for `addr` occupies in a restarted child.
    pub fn fd(&self, addr: &str) -> Option<RawFd> {
        self.offset(addr).map(fd_for_offset)
    }

    /// Entries in list order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(a, o)| (a.as_str(), *o))
    }

    /// Addresses in list order.
    pub fn addrs(&self) -> Vec<String> {
        self.entries.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slot reserved for the readiness pipe, right after the listeners.
    pub fn readiness_fd(&self) -> RawFd {
        fd_for_offset(self.entries.len())
    }

    /// Address-keyed view of the table.
    pub fn to_map(&self) -> HashMap<String, usize> {
        let mut map = HashMap::with_capacity(self.entries.len());
        for (addr, offset) in &self.entries {
            map.entry(addr.clone()).or_insert(*offset);
        }
        map
    }
}

/// Descriptor slot for a given offset.
pub fn fd_for_offset(offset: usize) -> RawFd {
    FIRST_INHERITED_FD + offset as RawFd
}
