//! Backing-store registry: CPU regions, external memory blocks and runtime
//! buffers, plus base-pointer lookup.

use log::{debug, error};

use crate::error::{MemoryError, Result};

/// Handle of one registered backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct StoreId(usize);

impl StoreId {
    /// Position of the store in its registry.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A resolved location: a store and a byte offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MemoryPointer {
    /// Store holding the bytes.
    pub store: StoreId,
    /// Byte offset into the store.
    pub offset: usize,
}

impl MemoryPointer {
    /// Builds a pointer to `offset` bytes into `store`.
    #[must_use]
    pub const fn new(store: StoreId, offset: usize) -> Self {
        Self { store, offset }
    }
}

/// Where a backing store came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// The ROM/RAM image declared for a CPU.
    Region {
        /// Owning CPU.
        cpu: usize,
    },
    /// Zeroed memory covering declared ranges past the end of the region.
    External {
        /// Owning CPU.
        cpu: usize,
        /// First covered address.
        start: u32,
        /// Last covered address.
        end: u32,
    },
    /// A buffer registered at runtime, such as a bank page.
    Buffer,
}

/// One owned byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStore {
    kind: StoreKind,
    data: Vec<u8>,
}

impl BackingStore {
    /// Origin of the buffer.
    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Buffer contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer contents.
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Start of the external block of `cpu` covering `address`.
    const fn external_start(&self, cpu: usize, address: u32) -> Option<u32> {
        match self.kind {
            StoreKind::External {
                cpu: owner,
                start,
                end,
            } if owner == cpu && start <= address && address <= end => Some(start),
            _ => None,
        }
    }
}

/// Inclusive address extent of one external memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalExtent {
    /// First covered address.
    pub start: u32,
    /// Last covered address.
    pub end: u32,
}

/// Plans the external memory blocks one CPU needs.
///
/// `ranges` are every declared read and write range of the CPU as inclusive
/// `(start, end)` pairs. Blocks cover each maximal contiguous run of ranges
/// that reaches past `region_len`, lowest first, and never overlap.
#[must_use]
pub fn plan_external_blocks(region_len: usize, ranges: &[(u32, u32)]) -> Vec<ExternalExtent> {
    let mut blocks = Vec::new();
    let mut limit = region_len as u64;

    loop {
        let Some(lowest) = ranges
            .iter()
            .filter(|&&(_, end)| u64::from(end) >= limit)
            .map(|&(start, _)| u64::from(start))
            .min()
        else {
            break;
        };

        let mut end = lowest;
        let mut last_end = None;
        while last_end != Some(end) {
            last_end = Some(end);
            for &(range_start, range_end) in ranges {
                let (range_start, range_end) = (u64::from(range_start), u64::from(range_end));
                if range_start <= end && range_end >= end {
                    end = range_end + 1;
                }
            }
        }

        let (Ok(start), Ok(last)) = (u32::try_from(lowest), u32::try_from(end - 1)) else {
            break;
        };
        blocks.push(ExternalExtent { start, end: last });
        limit = end;
    }

    blocks
}

/// Reorders a big-endian 16-bit image into little-endian lane order.
///
/// Word-bus stores keep each 16-bit cell least significant byte first; images
/// dumped from big-endian hardware are converted once at load time.
pub fn swap_word_lanes(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Owner of every backing store in a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreRegistry {
    stores: Vec<BackingStore>,
    regions: Vec<StoreId>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stores: Vec::new(),
            regions: Vec::new(),
        }
    }

    fn push(&mut self, kind: StoreKind, data: Vec<u8>) -> StoreId {
        let id = StoreId(self.stores.len());
        self.stores.push(BackingStore { kind, data });
        id
    }

    /// Registers the region image of the next CPU.
    pub fn add_region(&mut self, data: Vec<u8>) -> StoreId {
        let cpu = self.regions.len();
        let id = self.push(StoreKind::Region { cpu }, data);
        self.regions.push(id);
        id
    }

    /// Registers a runtime buffer, typically a bank page.
    pub fn add_store(&mut self, data: Vec<u8>) -> StoreId {
        self.push(StoreKind::Buffer, data)
    }

    /// Allocates zeroed external memory for every block `cpu` needs.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] when `cpu` has no region and
    /// [`MemoryError::ExternalAllocation`] when a block cannot be reserved.
    pub fn allocate_external_memory(
        &mut self,
        cpu: usize,
        ranges: &[(u32, u32)],
    ) -> Result<Vec<StoreId>> {
        let region_len = self.store(self.region(cpu)?)?.len();
        let mut allocated = Vec::new();
        for extent in plan_external_blocks(region_len, ranges) {
            let len = (extent.end - extent.start) as usize + 1;
            let mut data = Vec::new();
            if data.try_reserve_exact(len).is_err() {
                error!(
                    "cpu #{cpu}: external memory {:08x}-{:08x} allocation failed",
                    extent.start, extent.end
                );
                return Err(MemoryError::ExternalAllocation {
                    cpu,
                    start: extent.start,
                    end: extent.end,
                });
            }
            data.resize(len, 0);
            debug!(
                "cpu #{cpu}: external memory {:08x}-{:08x}",
                extent.start, extent.end
            );
            allocated.push(self.push(
                StoreKind::External {
                    cpu,
                    start: extent.start,
                    end: extent.end,
                },
                data,
            ));
        }
        Ok(allocated)
    }

    /// Region store of `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn region(&self, cpu: usize) -> Result<StoreId> {
        self.regions
            .get(cpu)
            .copied()
            .ok_or(MemoryError::InvalidCpu(cpu))
    }

    /// Resolves `address` of `cpu` to its backing location.
    ///
    /// External blocks are searched first; otherwise the address is an
    /// offset into the CPU region.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidCpu`] for an unknown CPU.
    pub fn find_base(&self, cpu: usize, address: u32) -> Result<MemoryPointer> {
        let region = self.region(cpu)?;
        let found = self
            .stores
            .iter()
            .enumerate()
            .find_map(|(index, store)| Some((index, store.external_start(cpu, address)?)));
        Ok(match found {
            Some((index, start)) => MemoryPointer::new(StoreId(index), (address - start) as usize),
            None => MemoryPointer::new(region, address as usize),
        })
    }

    /// Returns `true` when `pointer` lies in an external block.
    #[must_use]
    pub fn is_external(&self, pointer: MemoryPointer) -> bool {
        self.stores
            .get(pointer.store.0)
            .is_some_and(|store| matches!(store.kind, StoreKind::External { .. }))
    }

    /// Metadata and contents of one store.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnknownStore`] for an unregistered id.
    pub fn get(&self, id: StoreId) -> Result<&BackingStore> {
        self.stores.get(id.0).ok_or(MemoryError::UnknownStore(id.0))
    }

    /// Bytes of one store.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnknownStore`] for an unregistered id.
    pub fn store(&self, id: StoreId) -> Result<&[u8]> {
        self.get(id).map(BackingStore::bytes)
    }

    /// Mutable bytes of one store.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnknownStore`] for an unregistered id.
    pub fn store_mut(&mut self, id: StoreId) -> Result<&mut [u8]> {
        self.stores
            .get_mut(id.0)
            .map(BackingStore::bytes_mut)
            .ok_or(MemoryError::UnknownStore(id.0))
    }

    /// Number of registered stores.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    fn slot(&self, store: StoreId, index: i64) -> Option<&u8> {
        let index = usize::try_from(index).ok()?;
        self.stores.get(store.0)?.data.get(index)
    }

    fn slot_mut(&mut self, store: StoreId, index: i64) -> Option<&mut u8> {
        let index = usize::try_from(index).ok()?;
        self.stores.get_mut(store.0)?.data.get_mut(index)
    }

    /// Byte at a signed position, `None` when outside the store.
    pub(crate) fn byte(&self, store: StoreId, index: i64) -> Option<u8> {
        self.slot(store, index).copied()
    }

    /// Stores a byte; returns `false` when outside the store.
    pub(crate) fn set_byte(&mut self, store: StoreId, index: i64, value: u8) -> bool {
        let Some(cell) = self.slot_mut(store, index) else {
            return false;
        };
        *cell = value;
        true
    }

    /// 16-bit cell in little-endian lane order.
    pub(crate) fn cell(&self, store: StoreId, index: i64) -> Option<u16> {
        let low = self.byte(store, index)?;
        let high = self.byte(store, index + 1)?;
        Some(u16::from_le_bytes([low, high]))
    }

    /// Stores a 16-bit cell in little-endian lane order.
    pub(crate) fn set_cell(&mut self, store: StoreId, index: i64, value: u16) -> bool {
        let [low, high] = value.to_le_bytes();
        if self.byte(store, index + 1).is_none() {
            return false;
        }
        self.set_byte(store, index, low) && self.set_byte(store, index + 1, high)
    }
}
