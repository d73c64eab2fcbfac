//! Stages of the single-device pipeline.

use crate::buffer::{ArgFlags, ArgGroup, ArrayHandle, StageBuffer};
use crate::cruncher::next_compute_id;

/// How a stage uses one of its arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Duplicated; host feeds the shuttle side, kernel reads
    Input,
    /// Duplicated; host drains the shuttle side, kernel writes
    Output,
    /// Not duplicated; private sequential state of this stage
    Internal,
    /// Connects to the adjacent stage through the same device arrays
    Transition,
}

pub(crate) struct DeviceSlot {
    pub(crate) role: BufferRole,
    pub(crate) buffer: StageBuffer,
}

/// One stage of a [`DevicePipeline`](super::DevicePipeline): kernels plus
/// role-tagged arrays in kernel-signature order.
pub struct DeviceStage {
    pub(crate) names: Vec<String>,
    pub(crate) globals: Vec<usize>,
    pub(crate) locals: Vec<usize>,
    pub(crate) slots: Vec<DeviceSlot>,
    pub(crate) compute_id: u32,
}

impl DeviceStage {
    /// Fresh stage with no kernels or arrays.
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            globals: Vec::new(),
            locals: Vec::new(),
            slots: Vec::new(),
            compute_id: next_compute_id(),
        }
    }

    /// Bind the ordered kernels of this stage with their ranges.
    pub fn add_kernels(mut self, names: &[&str], globals: &[usize], locals: &[usize]) -> Self {
        self.names.extend(names.iter().map(|s| s.to_string()));
        self.globals.extend_from_slice(globals);
        self.locals.extend_from_slice(locals);
        self
    }

    /// Bind a host-fed array.
    pub fn add_input_array(mut self, array: ArrayHandle) -> Self {
        self.slots.push(DeviceSlot {
            role: BufferRole::Input,
            buffer: StageBuffer::new(array, true),
        });
        self
    }

    /// Bind a host-drained array.
    pub fn add_output_array(mut self, array: ArrayHandle) -> Self {
        self.slots.push(DeviceSlot {
            role: BufferRole::Output,
            buffer: StageBuffer::new(array, true),
        });
        self
    }

    /// Bind private sequential state.
    pub fn add_internal_array(mut self, array: ArrayHandle) -> Self {
        self.slots.push(DeviceSlot {
            role: BufferRole::Internal,
            buffer: StageBuffer::new(array, false),
        });
        self
    }

    /// Bind a stage-to-stage transition array.
    ///
    /// Pairing happens when the stage is added to a pipeline: if the
    /// previous stage bound the same underlying array, this side adopts
    /// that buffer's pair instead of allocating its own, so the handover
    /// is a pointer swap rather than a copy.
    pub fn add_transition_array(mut self, array: ArrayHandle) -> Self {
        self.slots.push(DeviceSlot {
            role: BufferRole::Transition,
            buffer: StageBuffer::new(array, false),
        });
        self
    }

    /// Number of bound arrays
    pub fn array_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn find_matching(&self, array: &ArrayHandle) -> Option<&StageBuffer> {
        self.slots
            .iter()
            .map(|s| &s.buffer)
            .find(|b| b.primary().same_array(array) || b.orig_primary().same_array(array))
    }

    pub(crate) fn switch_all(&mut self) {
        for slot in &mut self.slots {
            slot.buffer.switch_buffers();
        }
    }

    /// Side selected by parity: primary on even, shuttle on odd.
    pub(crate) fn side(buffer: &StageBuffer, odd: bool) -> ArrayHandle {
        if odd {
            buffer
                .switched_buffer()
                .cloned()
                .unwrap_or_else(|| buffer.primary().clone())
        } else {
            buffer.primary().clone()
        }
    }

    /// Argument group for the kernels with every flag off.
    ///
    /// I/O arrays follow the parity side; internal and transition state
    /// stays on the primary so it persists across feeds.
    pub(crate) fn kernel_args(&self, odd: bool) -> ArgGroup {
        let mut args = ArgGroup::new();
        for slot in &self.slots {
            let handle = match slot.role {
                BufferRole::Input | BufferRole::Output => Self::side(&slot.buffer, odd),
                BufferRole::Internal | BufferRole::Transition => slot.buffer.primary().clone(),
            };
            args.push(handle, ArgFlags::none());
        }
        args
    }

    /// Transfer group for serial mode: inputs of the parity side, read.
    pub(crate) fn input_transfer_args(&self, odd: bool) -> ArgGroup {
        let mut args = ArgGroup::new();
        for slot in &self.slots {
            if slot.role == BufferRole::Input {
                args.push(Self::side(&slot.buffer, odd), ArgFlags::input());
            }
        }
        args
    }

    /// Transfer group for serial mode: outputs of the parity side, write.
    pub(crate) fn output_transfer_args(&self, odd: bool) -> ArgGroup {
        let mut args = ArgGroup::new();
        for slot in &self.slots {
            if slot.role == BufferRole::Output {
                args.push(Self::side(&slot.buffer, odd), ArgFlags::output());
            }
        }
        args
    }

    /// Transfer group for parallel mode: upload the active input sides,
    /// download the shuttle output sides filled by the previous feed.
    pub(crate) fn overlap_transfer_args(&self) -> ArgGroup {
        let mut args = ArgGroup::new();
        for slot in &self.slots {
            match slot.role {
                BufferRole::Input => {
                    args.push(slot.buffer.primary().clone(), ArgFlags::input());
                }
                BufferRole::Output => {
                    let handle = slot
                        .buffer
                        .switched_buffer()
                        .unwrap_or_else(|| slot.buffer.primary())
                        .clone();
                    args.push(handle, ArgFlags::output());
                }
                BufferRole::Internal | BufferRole::Transition => {}
            }
        }
        args
    }
}

impl Default for DeviceStage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStage")
            .field("kernels", &self.names)
            .field("arrays", &self.slots.len())
            .finish()
    }
}
