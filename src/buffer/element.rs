//! Element kinds, shared array handles, and the host-array boundary.
//!
//! Every buffer crossing the host/device boundary carries an
//! [`ElementKind`]; copies fan out once over the sum instead of once per
//! concrete type at every call site.

use crate::error::{Error, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Closed set of element kinds a buffer may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// unsigned byte
    U8,
    /// signed byte (char)
    I8,
    /// 32-bit signed integer
    I32,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit signed integer
    I64,
    /// opaque struct array with an explicit per-work-item byte stride
    Struct,
}

/// Backing storage for one array, tagged by kind.
#[derive(Debug, Clone)]
pub enum ArrayData {
    /// f32 elements
    F32(Vec<f32>),
    /// f64 elements
    F64(Vec<f64>),
    /// u8 elements
    U8(Vec<u8>),
    /// i8 elements
    I8(Vec<i8>),
    /// i32 elements
    I32(Vec<i32>),
    /// u32 elements
    U32(Vec<u32>),
    /// i64 elements
    I64(Vec<i64>),
    /// raw bytes with a per-work-item stride
    Struct {
        /// raw storage
        bytes: Vec<u8>,
        /// bytes per work item
        stride: usize,
    },
}

impl ArrayData {
    /// Allocate zeroed storage of `kind` with `len` elements.
    ///
    /// For `Struct`, `len` counts work items and `stride` is the byte
    /// width of one item; other kinds ignore `stride`.
    pub fn zeroed(kind: ElementKind, len: usize, stride: usize) -> Self {
        match kind {
            ElementKind::F32 => ArrayData::F32(vec![0.0; len]),
            ElementKind::F64 => ArrayData::F64(vec![0.0; len]),
            ElementKind::U8 => ArrayData::U8(vec![0; len]),
            ElementKind::I8 => ArrayData::I8(vec![0; len]),
            ElementKind::I32 => ArrayData::I32(vec![0; len]),
            ElementKind::U32 => ArrayData::U32(vec![0; len]),
            ElementKind::I64 => ArrayData::I64(vec![0; len]),
            ElementKind::Struct => ArrayData::Struct {
                bytes: vec![0; len * stride.max(1)],
                stride: stride.max(1),
            },
        }
    }

    /// The kind of this storage
    pub fn kind(&self) -> ElementKind {
        match self {
            ArrayData::F32(_) => ElementKind::F32,
            ArrayData::F64(_) => ElementKind::F64,
            ArrayData::U8(_) => ElementKind::U8,
            ArrayData::I8(_) => ElementKind::I8,
            ArrayData::I32(_) => ElementKind::I32,
            ArrayData::U32(_) => ElementKind::U32,
            ArrayData::I64(_) => ElementKind::I64,
            ArrayData::Struct { .. } => ElementKind::Struct,
        }
    }

    /// Element count (work items for `Struct`)
    pub fn len(&self) -> usize {
        match self {
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::U32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::Struct { bytes, stride } => bytes.len() / stride.max(&1),
        }
    }

    /// True if the storage holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the full contents of `src` into `self`.
    ///
    /// Kind and length must match.
    pub fn copy_from(&mut self, src: &ArrayData) -> Result<()> {
        if self.kind() != src.kind() {
            return Err(Error::binding(format!(
                "copy kind mismatch: {:?} into {:?}",
                src.kind(),
                self.kind()
            )));
        }
        if self.len() != src.len() {
            return Err(Error::binding(format!(
                "copy length mismatch: {} into {}",
                src.len(),
                self.len()
            )));
        }
        match (self, src) {
            (ArrayData::F32(d), ArrayData::F32(s)) => d.copy_from_slice(s),
            (ArrayData::F64(d), ArrayData::F64(s)) => d.copy_from_slice(s),
            (ArrayData::U8(d), ArrayData::U8(s)) => d.copy_from_slice(s),
            (ArrayData::I8(d), ArrayData::I8(s)) => d.copy_from_slice(s),
            (ArrayData::I32(d), ArrayData::I32(s)) => d.copy_from_slice(s),
            (ArrayData::U32(d), ArrayData::U32(s)) => d.copy_from_slice(s),
            (ArrayData::I64(d), ArrayData::I64(s)) => d.copy_from_slice(s),
            (
                ArrayData::Struct { bytes: d, .. },
                ArrayData::Struct { bytes: s, .. },
            ) => d.copy_from_slice(s),
            _ => unreachable!("kind checked above"),
        }
        Ok(())
    }
}

static NEXT_ARRAY_ID: AtomicU64 = AtomicU64::new(1);

struct ArrayInner {
    id: u64,
    kind: ElementKind,
    len: usize,
    elems_per_item: usize,
    data: RwLock<ArrayData>,
}

/// Shared handle to one host-visible array.
///
/// Clones refer to the same storage; identity is observable through
/// [`ArrayHandle::id`] and [`ArrayHandle::same_array`], which transition
/// buffers rely on to detect that two stages bound the same array.
#[derive(Clone)]
pub struct ArrayHandle {
    inner: Arc<ArrayInner>,
}

impl ArrayHandle {
    /// Allocate a zeroed array.
    pub fn zeroed(kind: ElementKind, len: usize) -> Self {
        Self::from_data(ArrayData::zeroed(kind, len, 1), 1)
    }

    /// Allocate a zeroed array with an explicit elements-per-work-item
    /// stride (for `Struct`, the byte width of one work item).
    pub fn zeroed_with_stride(kind: ElementKind, len: usize, elems_per_item: usize) -> Self {
        Self::from_data(ArrayData::zeroed(kind, len, elems_per_item), elems_per_item)
    }

    /// Wrap existing storage.
    pub fn from_data(data: ArrayData, elems_per_item: usize) -> Self {
        let kind = data.kind();
        let len = data.len();
        Self {
            inner: Arc::new(ArrayInner {
                id: NEXT_ARRAY_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                len,
                elems_per_item: elems_per_item.max(1),
                data: RwLock::new(data),
            }),
        }
    }

    /// Wrap an f32 vector.
    pub fn from_f32(v: Vec<f32>) -> Self {
        Self::from_data(ArrayData::F32(v), 1)
    }

    /// Wrap an f64 vector.
    pub fn from_f64(v: Vec<f64>) -> Self {
        Self::from_data(ArrayData::F64(v), 1)
    }

    /// Wrap an i32 vector.
    pub fn from_i32(v: Vec<i32>) -> Self {
        Self::from_data(ArrayData::I32(v), 1)
    }

    /// Process-unique array id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Element kind
    pub fn kind(&self) -> ElementKind {
        self.inner.kind
    }

    /// Element count (work items for `Struct`)
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True if the array holds no elements
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Elements per work item carried across duplication
    pub fn elems_per_item(&self) -> usize {
        self.inner.elems_per_item
    }

    /// A new zeroed array of the same kind, length, and stride.
    pub fn alloc_like(&self) -> Self {
        let stride = match &*self.read() {
            ArrayData::Struct { stride, .. } => *stride,
            _ => self.inner.elems_per_item,
        };
        Self::from_data(
            ArrayData::zeroed(self.inner.kind, self.inner.len, stride),
            self.inner.elems_per_item,
        )
    }

    /// Shared read access to the storage
    pub fn read(&self) -> RwLockReadGuard<'_, ArrayData> {
        self.inner.data.read()
    }

    /// Exclusive write access to the storage
    pub fn write(&self) -> RwLockWriteGuard<'_, ArrayData> {
        self.inner.data.write()
    }

    /// Clone of the current contents
    pub fn snapshot(&self) -> ArrayData {
        self.read().clone()
    }

    /// True if both handles refer to the same storage
    pub fn same_array(&self, other: &ArrayHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copy the full contents of `src` into this array.
    pub fn copy_from_handle(&self, src: &ArrayHandle) -> Result<()> {
        // Lock ordering by id avoids deadlock when two copies cross.
        if self.same_array(src) {
            return Ok(());
        }
        if self.id() < src.id() {
            let mut dst = self.write();
            let s = src.read();
            dst.copy_from(&s)
        } else {
            let s = src.read();
            let mut dst = self.write();
            dst.copy_from(&s)
        }
    }
}

impl std::fmt::Debug for ArrayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("len", &self.inner.len)
            .finish()
    }
}

/// Borrowed host array fed into a pipeline.
#[derive(Debug, Clone, Copy)]
pub enum HostSlice<'a> {
    /// f32 elements
    F32(&'a [f32]),
    /// f64 elements
    F64(&'a [f64]),
    /// u8 elements
    U8(&'a [u8]),
    /// i8 elements
    I8(&'a [i8]),
    /// i32 elements
    I32(&'a [i32]),
    /// u32 elements
    U32(&'a [u32]),
    /// i64 elements
    I64(&'a [i64]),
    /// struct bytes with a per-work-item stride
    Struct {
        /// raw storage
        bytes: &'a [u8],
        /// bytes per work item
        stride: usize,
    },
}

impl HostSlice<'_> {
    /// Element kind of the borrowed array
    pub fn kind(&self) -> ElementKind {
        match self {
            HostSlice::F32(_) => ElementKind::F32,
            HostSlice::F64(_) => ElementKind::F64,
            HostSlice::U8(_) => ElementKind::U8,
            HostSlice::I8(_) => ElementKind::I8,
            HostSlice::I32(_) => ElementKind::I32,
            HostSlice::U32(_) => ElementKind::U32,
            HostSlice::I64(_) => ElementKind::I64,
            HostSlice::Struct { .. } => ElementKind::Struct,
        }
    }

    /// Element count (work items for `Struct`)
    pub fn len(&self) -> usize {
        match self {
            HostSlice::F32(v) => v.len(),
            HostSlice::F64(v) => v.len(),
            HostSlice::U8(v) => v.len(),
            HostSlice::I8(v) => v.len(),
            HostSlice::I32(v) => v.len(),
            HostSlice::U32(v) => v.len(),
            HostSlice::I64(v) => v.len(),
            HostSlice::Struct { bytes, stride } => bytes.len() / stride.max(&1),
        }
    }

    /// True if the borrowed array holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the borrowed host array into `dst`.
    pub fn copy_into(&self, dst: &ArrayHandle) -> Result<()> {
        if self.kind() != dst.kind() {
            return Err(Error::binding(format!(
                "host copy kind mismatch: {:?} into {:?}",
                self.kind(),
                dst.kind()
            )));
        }
        let mut data = dst.write();
        match (&mut *data, self) {
            (ArrayData::F32(d), HostSlice::F32(s)) => d.copy_from_slice(s),
            (ArrayData::F64(d), HostSlice::F64(s)) => d.copy_from_slice(s),
            (ArrayData::U8(d), HostSlice::U8(s)) => d.copy_from_slice(s),
            (ArrayData::I8(d), HostSlice::I8(s)) => d.copy_from_slice(s),
            (ArrayData::I32(d), HostSlice::I32(s)) => d.copy_from_slice(s),
            (ArrayData::U32(d), HostSlice::U32(s)) => d.copy_from_slice(s),
            (ArrayData::I64(d), HostSlice::I64(s)) => d.copy_from_slice(s),
            (ArrayData::Struct { bytes: d, .. }, HostSlice::Struct { bytes: s, .. }) => {
                d.copy_from_slice(s)
            }
            _ => unreachable!("kind checked above"),
        }
        Ok(())
    }
}

/// Mutable borrowed host array drained from a pipeline.
#[derive(Debug)]
pub enum HostSliceMut<'a> {
    /// f32 elements
    F32(&'a mut [f32]),
    /// f64 elements
    F64(&'a mut [f64]),
    /// u8 elements
    U8(&'a mut [u8]),
    /// i8 elements
    I8(&'a mut [i8]),
    /// i32 elements
    I32(&'a mut [i32]),
    /// u32 elements
    U32(&'a mut [u32]),
    /// i64 elements
    I64(&'a mut [i64]),
    /// struct bytes with a per-work-item stride
    Struct {
        /// raw storage
        bytes: &'a mut [u8],
        /// bytes per work item
        stride: usize,
    },
}

impl HostSliceMut<'_> {
    /// Element kind of the borrowed array
    pub fn kind(&self) -> ElementKind {
        match self {
            HostSliceMut::F32(_) => ElementKind::F32,
            HostSliceMut::F64(_) => ElementKind::F64,
            HostSliceMut::U8(_) => ElementKind::U8,
            HostSliceMut::I8(_) => ElementKind::I8,
            HostSliceMut::I32(_) => ElementKind::I32,
            HostSliceMut::U32(_) => ElementKind::U32,
            HostSliceMut::I64(_) => ElementKind::I64,
            HostSliceMut::Struct { .. } => ElementKind::Struct,
        }
    }

    /// Element count (work items for `Struct`)
    pub fn len(&self) -> usize {
        match self {
            HostSliceMut::F32(v) => v.len(),
            HostSliceMut::F64(v) => v.len(),
            HostSliceMut::U8(v) => v.len(),
            HostSliceMut::I8(v) => v.len(),
            HostSliceMut::I32(v) => v.len(),
            HostSliceMut::U32(v) => v.len(),
            HostSliceMut::I64(v) => v.len(),
            HostSliceMut::Struct { bytes, stride } => bytes.len() / stride.max(&1),
        }
    }

    /// True if the borrowed array holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the borrowed host array from `src`.
    pub fn copy_from(&mut self, src: &ArrayHandle) -> Result<()> {
        if self.kind() != src.kind() {
            return Err(Error::binding(format!(
                "host copy kind mismatch: {:?} into {:?}",
                src.kind(),
                self.kind()
            )));
        }
        let data = src.read();
        match (self, &*data) {
            (HostSliceMut::F32(d), ArrayData::F32(s)) => d.copy_from_slice(s),
            (HostSliceMut::F64(d), ArrayData::F64(s)) => d.copy_from_slice(s),
            (HostSliceMut::U8(d), ArrayData::U8(s)) => d.copy_from_slice(s),
            (HostSliceMut::I8(d), ArrayData::I8(s)) => d.copy_from_slice(s),
            (HostSliceMut::I32(d), ArrayData::I32(s)) => d.copy_from_slice(s),
            (HostSliceMut::U32(d), ArrayData::U32(s)) => d.copy_from_slice(s),
            (HostSliceMut::I64(d), ArrayData::I64(s)) => d.copy_from_slice(s),
            (HostSliceMut::Struct { bytes: d, .. }, ArrayData::Struct { bytes: s, .. }) => {
                d.copy_from_slice(s)
            }
            _ => unreachable!("kind checked above"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_allocation() {
        let h = ArrayHandle::zeroed(ElementKind::F32, 8);
        assert_eq!(h.kind(), ElementKind::F32);
        assert_eq!(h.len(), 8);
        match &*h.read() {
            ArrayData::F32(v) => assert!(v.iter().all(|x| *x == 0.0)),
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_handle_identity() {
        let a = ArrayHandle::from_f32(vec![1.0, 2.0]);
        let b = a.clone();
        let c = ArrayHandle::from_f32(vec![1.0, 2.0]);
        assert!(a.same_array(&b));
        assert!(!a.same_array(&c));
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_host_round_trip() {
        let h = ArrayHandle::zeroed(ElementKind::F32, 4);
        let src = [1.0f32, 2.0, 3.0, 4.0];
        HostSlice::F32(&src).copy_into(&h).unwrap();

        let mut out = [0.0f32; 4];
        HostSliceMut::F32(&mut out).copy_from(&h).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let h = ArrayHandle::zeroed(ElementKind::I32, 4);
        let src = [1.0f32; 4];
        assert!(HostSlice::F32(&src).copy_into(&h).is_err());
    }

    #[test]
    fn test_struct_stride_carried() {
        let h = ArrayHandle::zeroed_with_stride(ElementKind::Struct, 3, 16);
        assert_eq!(h.len(), 3);
        let like = h.alloc_like();
        assert_eq!(like.len(), 3);
        match &*like.read() {
            ArrayData::Struct { bytes, stride } => {
                assert_eq!(*stride, 16);
                assert_eq!(bytes.len(), 48);
            }
            _ => panic!("wrong kind"),
        };
    }

    #[test]
    fn test_copy_from_handle() {
        let a = ArrayHandle::from_i32(vec![1, 2, 3]);
        let b = ArrayHandle::zeroed(ElementKind::I32, 3);
        b.copy_from_handle(&a).unwrap();
        match &*b.read() {
            ArrayData::I32(v) => assert_eq!(v, &vec![1, 2, 3]),
            _ => panic!("wrong kind"),
        };
    }
}
