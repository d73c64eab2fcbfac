//! Kernel argument groups.
//!
//! An [`ArgGroup`] is the flat value form of an argument chain: the
//! handles in kernel-signature order plus per-argument transfer flags.
//! Stages mutate the flag slots per kernel index; tasks freeze a clone.

use super::element::{ArrayHandle, ElementKind};

/// Transfer flags attached to one kernel argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgFlags {
    /// Copy host to device before the kernel
    pub read: bool,
    /// Copy device to host after the kernel
    pub write: bool,
    /// Each device reads only its own sub-range
    pub partial_read: bool,
}

impl ArgFlags {
    /// Flags for an input argument (`read` only)
    pub fn input() -> Self {
        Self {
            read: true,
            write: false,
            partial_read: false,
        }
    }

    /// Flags for an output argument (`write` only)
    pub fn output() -> Self {
        Self {
            read: false,
            write: true,
            partial_read: false,
        }
    }

    /// All flags off (hidden / device-resident arguments)
    pub fn none() -> Self {
        Self::default()
    }
}

/// One argument slot: array handle plus its flags.
#[derive(Debug, Clone)]
pub struct ArgSlot {
    /// The bound array
    pub handle: ArrayHandle,
    /// Transfer flags for this dispatch
    pub flags: ArgFlags,
}

/// Ordered kernel argument list with per-slot transfer flags.
#[derive(Debug, Clone, Default)]
pub struct ArgGroup {
    slots: Vec<ArgSlot>,
}

impl ArgGroup {
    /// Empty group
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Group with a single argument
    pub fn single(handle: ArrayHandle, flags: ArgFlags) -> Self {
        let mut group = Self::new();
        group.push(handle, flags);
        group
    }

    /// Append an argument
    pub fn push(&mut self, handle: ArrayHandle, flags: ArgFlags) {
        self.slots.push(ArgSlot { handle, flags });
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the group has no arguments
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slots in kernel-signature order
    pub fn slots(&self) -> &[ArgSlot] {
        &self.slots
    }

    /// Slot accessor
    pub fn get(&self, index: usize) -> Option<&ArgSlot> {
        self.slots.get(index)
    }

    /// Replace the flags of one slot
    pub fn set_flags(&mut self, index: usize, flags: ArgFlags) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.flags = flags;
        }
    }

    /// Turn every flag off
    pub fn clear_flags(&mut self) {
        for slot in &mut self.slots {
            slot.flags = ArgFlags::none();
        }
    }

    /// A clone with only the `read`/`partial_read` flags retained
    pub fn reads_only(&self) -> Self {
        let mut out = self.clone();
        for slot in &mut out.slots {
            slot.flags.write = false;
        }
        out
    }

    /// A clone with only the `write` flags retained
    pub fn writes_only(&self) -> Self {
        let mut out = self.clone();
        for slot in &mut out.slots {
            slot.flags.read = false;
            slot.flags.partial_read = false;
        }
        out
    }

    /// A clone with every flag off
    pub fn flags_cleared(&self) -> Self {
        let mut out = self.clone();
        out.clear_flags();
        out
    }

    /// Element kinds in argument order
    pub fn kinds(&self) -> Vec<ElementKind> {
        self.slots.iter().map(|s| s.handle.kind()).collect()
    }

    /// Elements-per-work-item in argument order
    pub fn elems_per_item(&self) -> Vec<usize> {
        self.slots.iter().map(|s| s.handle.elems_per_item()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_rewrite() {
        let mut group = ArgGroup::new();
        group.push(ArrayHandle::zeroed(ElementKind::F32, 4), ArgFlags::input());
        group.push(ArrayHandle::zeroed(ElementKind::F32, 4), ArgFlags::output());

        assert!(group.get(0).unwrap().flags.read);
        assert!(group.get(1).unwrap().flags.write);

        group.set_flags(0, ArgFlags::none());
        assert!(!group.get(0).unwrap().flags.read);

        group.clear_flags();
        assert_eq!(group.get(1).unwrap().flags, ArgFlags::none());
    }

    #[test]
    fn test_phase_projections() {
        let mut group = ArgGroup::new();
        group.push(ArrayHandle::zeroed(ElementKind::F32, 2), ArgFlags::input());
        group.push(ArrayHandle::zeroed(ElementKind::F32, 2), ArgFlags::output());

        let reads = group.reads_only();
        assert!(reads.get(0).unwrap().flags.read);
        assert!(!reads.get(1).unwrap().flags.write);

        let writes = group.writes_only();
        assert!(!writes.get(0).unwrap().flags.read);
        assert!(writes.get(1).unwrap().flags.write);
    }
}
