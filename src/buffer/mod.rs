//! Typed device arrays and the double-buffering primitives built on them.

pub mod arg_group;
pub mod element;
pub mod stage_buffer;

pub use arg_group::{ArgFlags, ArgGroup, ArgSlot};
pub use element::{ArrayData, ArrayHandle, ElementKind, HostSlice, HostSliceMut};
pub use stage_buffer::StageBuffer;
