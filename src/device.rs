//! Accelerator kinds and device sets.
//!
//! A [`DeviceSet`] is the unit that pipeline stages and device pools bind
//! to: a driver handle plus the descriptors of the devices selected from
//! it. Selection honours the negative-count conventions of the facade
//! constructors (`-1` means "all minus one" for CPU fission, "all" for
//! GPUs).

use crate::driver::Driver;
use crate::error::{Error, Result};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Bitmask of accelerator kinds a selection may combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcceleratorMask(u32);

impl AcceleratorMask {
    /// CPU devices
    pub const CPU: AcceleratorMask = AcceleratorMask(1);
    /// GPU devices
    pub const GPU: AcceleratorMask = AcceleratorMask(2);
    /// Dedicated accelerator devices
    pub const ACC: AcceleratorMask = AcceleratorMask(4);
    /// Every kind
    pub const ALL: AcceleratorMask = AcceleratorMask(1 | 2 | 4);

    /// Raw bits of the mask
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True if every kind in `other` is present in `self`
    pub fn contains(self, other: AcceleratorMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no kind is selected
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AcceleratorMask {
    type Output = AcceleratorMask;

    fn bitor(self, rhs: AcceleratorMask) -> AcceleratorMask {
        AcceleratorMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for AcceleratorMask {
    fn bitor_assign(&mut self, rhs: AcceleratorMask) {
        self.0 |= rhs.0;
    }
}

/// One enumerated device as reported by a driver.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Driver-scoped device index
    pub id: usize,
    /// Human-readable device name
    pub name: String,
    /// The kind this device belongs to (exactly one bit set)
    pub kind: AcceleratorMask,
    /// Relative compute capability score (higher is faster)
    pub relative_speed: f64,
}

/// A driver handle plus the devices selected from it.
#[derive(Clone)]
pub struct DeviceSet {
    driver: Arc<dyn Driver>,
    devices: Vec<DeviceDescriptor>,
}

impl DeviceSet {
    /// Select devices from `driver` by kind mask.
    ///
    /// `cpu_fission_count < 0` selects every enumerated CPU device (the
    /// driver typically fissions to cores minus one); `gpu_count < 0`
    /// selects every GPU. Non-negative counts cap the selection.
    pub fn select(
        driver: Arc<dyn Driver>,
        mask: AcceleratorMask,
        cpu_fission_count: i32,
        gpu_count: i32,
    ) -> Result<Self> {
        if mask.is_empty() {
            return Err(Error::config("accelerator mask selects no device kind"));
        }

        let enumerated = driver.enumerate(mask);
        let mut devices = Vec::new();
        let mut cpus = 0i32;
        let mut gpus = 0i32;

        for desc in enumerated {
            if desc.kind == AcceleratorMask::CPU {
                if cpu_fission_count >= 0 && cpus >= cpu_fission_count {
                    continue;
                }
                cpus += 1;
            } else if desc.kind == AcceleratorMask::GPU {
                if gpu_count >= 0 && gpus >= gpu_count {
                    continue;
                }
                gpus += 1;
            }
            devices.push(desc);
        }

        if devices.is_empty() {
            return Err(Error::driver("no device matches the requested selection"));
        }

        Ok(Self { driver, devices })
    }

    /// Every device of `driver` matching `mask`.
    pub fn all(driver: Arc<dyn Driver>, mask: AcceleratorMask) -> Result<Self> {
        Self::select(driver, mask, -1, -1)
    }

    /// A set containing exactly the `index`-th device of this set.
    pub fn single(&self, index: usize) -> Result<Self> {
        let desc = self
            .devices
            .get(index)
            .ok_or_else(|| Error::driver(format!("device index {} out of range", index)))?
            .clone();
        Ok(Self {
            driver: Arc::clone(&self.driver),
            devices: vec![desc],
        })
    }

    /// The driver behind this set
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Selected device descriptors
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Number of selected devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device is selected
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Names of the selected devices
    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("devices", &self.devices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_combination() {
        let mask = AcceleratorMask::CPU | AcceleratorMask::GPU;
        assert!(mask.contains(AcceleratorMask::CPU));
        assert!(mask.contains(AcceleratorMask::GPU));
        assert!(!mask.contains(AcceleratorMask::ACC));
        assert_eq!(mask.bits(), 3);
    }

    #[test]
    fn test_all_contains_everything() {
        assert!(AcceleratorMask::ALL.contains(AcceleratorMask::ACC));
        assert!(AcceleratorMask::ALL.contains(AcceleratorMask::CPU | AcceleratorMask::GPU));
    }
}
