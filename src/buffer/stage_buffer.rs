//! Double-buffered stage slots.

use super::arg_group::ArgFlags;
use super::element::{ArrayHandle, ElementKind};

/// One logical array slot in a stage, paired with its shadow for
/// double buffering.
///
/// `primary` is the side the stage's current dispatch reads and writes;
/// `duplicate` is the side being shuttled by forwarding copies.
/// [`StageBuffer::switch_buffers`] exchanges the two. A non-duplicated
/// buffer (hidden state, internal arrays, the adopting side of a
/// transition pair whose source is single-sided) has no shadow and
/// switching it is a no-op.
#[derive(Debug)]
pub struct StageBuffer {
    kind: ElementKind,
    primary: ArrayHandle,
    duplicate: Option<ArrayHandle>,
    orig_primary: ArrayHandle,
    flags: ArgFlags,
}

impl StageBuffer {
    /// Wrap `array`; allocate an equally-sized shadow when `duplicated`.
    pub fn new(array: ArrayHandle, duplicated: bool) -> Self {
        let duplicate = if duplicated {
            Some(array.alloc_like())
        } else {
            None
        };
        Self {
            kind: array.kind(),
            orig_primary: array.clone(),
            primary: array,
            duplicate,
            flags: ArgFlags::none(),
        }
    }

    /// Wrap an existing pair (transition buffers adopting the previous
    /// stage's sides).
    pub fn shared_pair(primary: ArrayHandle, duplicate: Option<ArrayHandle>) -> Self {
        Self {
            kind: primary.kind(),
            orig_primary: primary.clone(),
            primary,
            duplicate,
            flags: ArgFlags::none(),
        }
    }

    /// Element kind of both sides
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Element count of both sides
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    /// True if the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// The side the current dispatch uses
    pub fn primary(&self) -> &ArrayHandle {
        &self.primary
    }

    /// The side being shuttled; `None` for non-duplicated buffers
    pub fn switched_buffer(&self) -> Option<&ArrayHandle> {
        self.duplicate.as_ref()
    }

    /// The array this slot was created with (debug only)
    pub fn orig_primary(&self) -> &ArrayHandle {
        &self.orig_primary
    }

    /// True if a shadow side exists
    pub fn is_duplicated(&self) -> bool {
        self.duplicate.is_some()
    }

    /// Exchange primary and duplicate. No-op without a duplicate.
    pub fn switch_buffers(&mut self) {
        if let Some(dup) = self.duplicate.take() {
            let old_primary = std::mem::replace(&mut self.primary, dup);
            self.duplicate = Some(old_primary);
        }
    }

    /// Release the shadow side; switching becomes a no-op.
    pub fn set_duplicated(&mut self, duplicated: bool) {
        if duplicated {
            if self.duplicate.is_none() {
                self.duplicate = Some(self.primary.alloc_like());
            }
        } else {
            self.duplicate = None;
        }
    }

    /// Current transfer flags (apply to both sides)
    pub fn flags(&self) -> ArgFlags {
        self.flags
    }

    /// Replace all flags at once
    pub fn set_flags(&mut self, flags: ArgFlags) {
        self.flags = flags;
    }

    /// Toggle host-to-device transfer
    pub fn set_read(&mut self, read: bool) {
        self.flags.read = read;
    }

    /// Toggle device-to-host transfer
    pub fn set_write(&mut self, write: bool) {
        self.flags.write = write;
    }

    /// Toggle per-device sub-range reads
    pub fn set_partial_read(&mut self, partial_read: bool) {
        self.flags.partial_read = partial_read;
    }
}
