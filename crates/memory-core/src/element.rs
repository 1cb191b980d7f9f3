//! Two-level element map: the address decoder behind every dispatch.
//!
//! Level 0 holds one cell per `1 << (level1_bits + min_bits)` addresses. A
//! cell below [`HARD_MAX`] is a handler id; a cell at or above it links to a
//! 256-cell block in the [`ElementArena`], indexed by the next `level1_bits`
//! address bits. Blocks are created on demand when an install boundary falls
//! inside a level-0 cell and inherit that cell's previous id.

use log::{debug, error, trace};

use crate::bus::{BusConfig, SUB_BLOCK_BITS};
use crate::error::{MemoryError, Result};
use crate::handler::{Direction, HandlerId, HARD_MAX};

/// Capacity of an arena in level-1 blocks.
pub const ELE_MAX: usize = 64;
/// Cells per level-1 block.
pub const SUB_BLOCK_CELLS: usize = 1 << SUB_BLOCK_BITS;

/// Monotonic pool of level-1 blocks shared by every CPU of one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementArena {
    direction: Direction,
    cells: Vec<u8>,
}

impl ElementArena {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new(direction: Direction) -> Self {
        Self {
            direction,
            cells: Vec::new(),
        }
    }

    /// Blocks allocated so far.
    #[must_use]
    pub fn blocks_used(&self) -> usize {
        self.cells.len() / SUB_BLOCK_CELLS
    }

    fn allocate(&mut self, fill: u8, blocks: usize) -> Result<usize> {
        let first = self.blocks_used();
        if first + blocks > ELE_MAX {
            error!("{} memory element size over", self.direction);
            return Err(MemoryError::ElementArenaExhausted {
                direction: self.direction,
                capacity: ELE_MAX,
            });
        }
        self.cells
            .resize(self.cells.len() + blocks * SUB_BLOCK_CELLS, fill);
        debug!("{} create element {first:2}({blocks:2})", self.direction);
        Ok(first)
    }
}

/// Which table a refinement step writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Root,
    Block(usize),
}

/// Decoder for one CPU and one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementMap {
    level0: Box<[u8]>,
    address_mask: u32,
    level0_shift: u32,
    min_bits: u32,
    level1_mask: u32,
    shifts: [u32; 3],
    masks: [i64; 3],
}

impl ElementMap {
    /// Creates a map with every cell unmapped.
    #[must_use]
    pub fn new(bus: &BusConfig) -> Self {
        let level0_mask = (1_i64 << bus.level0_bits) - 1;
        Self {
            level0: vec![HandlerId::UNMAPPED.get(); bus.level0_len()].into_boxed_slice(),
            address_mask: bus.address_mask(),
            level0_shift: bus.level0_shift(),
            min_bits: u32::from(bus.min_bits),
            level1_mask: bus.level1_mask(),
            shifts: [u32::from(bus.level1_bits), 0, 0],
            masks: [level0_mask, i64::from(bus.level1_mask()), 0],
        }
    }

    /// Handler id backing `address`.
    #[must_use]
    pub fn resolve(&self, arena: &ElementArena, address: u32) -> HandlerId {
        let cell = self.level0_cell(address);
        if let Some(id) = HandlerId::from_cell(cell) {
            return id;
        }
        let block = usize::from(cell) - HARD_MAX;
        let index = ((address & self.address_mask) >> self.min_bits) & self.level1_mask;
        arena
            .cells
            .get(block * SUB_BLOCK_CELLS + index as usize)
            .copied()
            .and_then(HandlerId::from_cell)
            .unwrap_or(HandlerId::UNMAPPED)
    }

    /// Raw level-0 cell for `address`: a handler id or a block link.
    #[must_use]
    pub fn level0_cell(&self, address: u32) -> u8 {
        let index = ((address & self.address_mask) >> self.level0_shift) as usize;
        self.level0
            .get(index)
            .copied()
            .unwrap_or(HandlerId::UNMAPPED.get())
    }

    /// Maps `start..=end` (CPU addresses) to `id`.
    ///
    /// Addresses are taken at handler granularity, so the low `min_bits` of
    /// both ends are ignored. An empty range is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::ElementArenaExhausted`] when a boundary needs a
    /// block the arena cannot provide. Cells written before the failure keep
    /// their new value.
    pub fn install(
        &mut self,
        arena: &mut ElementArena,
        start: u32,
        end: u32,
        id: HandlerId,
    ) -> Result<()> {
        self.set_element(
            arena,
            i64::from(start >> self.min_bits),
            i64::from(end >> self.min_bits),
            id,
        )
    }

    fn set_element(
        &mut self,
        arena: &mut ElementArena,
        sp: i64,
        ep: i64,
        id: HandlerId,
    ) -> Result<()> {
        trace!("set_element {sp:8X}-{ep:8X} = {id}");
        if sp > ep {
            return Ok(());
        }

        let value = id.get();
        let mut depth = 0;
        let mut start_table = Some(Table::Root);
        let mut end_table = Some(Table::Root);

        loop {
            let mask = self.masks[depth];
            let shift = self.shifts[depth];

            let ss = sp >> shift;
            let sb = if sp == 0 { 0 } else { ((sp - 1) >> shift) + 1 };
            let eb = ((ep + 1) >> shift) - 1;
            let ee = ep >> shift;

            if sb <= eb {
                if (sb | mask) == (eb | mask) {
                    if let Some(table) = start_table.or(end_table) {
                        self.fill(arena, table, sb, eb, mask, value);
                    }
                } else {
                    if let Some(table) = start_table {
                        self.fill(arena, table, sb, sb | mask, mask, value);
                    }
                    if let Some(table) = end_table {
                        self.fill(arena, table, eb & !mask, eb, mask, value);
                    }
                }
            }

            depth += 1;
            let next_mask = self.masks[depth];

            start_table = match start_table {
                Some(table) if ss != sb => {
                    Some(self.get_element(arena, table, ss & mask, next_mask)?)
                }
                _ => None,
            };
            end_table = match end_table {
                Some(table) if ee != eb => {
                    Some(self.get_element(arena, table, ee & mask, next_mask)?)
                }
                _ => None,
            };

            if start_table.is_none() && end_table.is_none() {
                return Ok(());
            }
        }
    }

    /// Follows the link at `index`, splitting the cell into a new block first
    /// when it still holds a plain id.
    fn get_element(
        &mut self,
        arena: &mut ElementArena,
        table: Table,
        index: i64,
        next_mask: i64,
    ) -> Result<Table> {
        let cell = self.cell(arena, table, index);
        if usize::from(cell) >= HARD_MAX {
            return Ok(Table::Block(usize::from(cell) - HARD_MAX));
        }

        let blocks = usize::try_from(next_mask >> SUB_BLOCK_BITS).unwrap_or(0) + 1;
        let block = arena.allocate(cell, blocks)?;
        let exhausted = MemoryError::ElementArenaExhausted {
            direction: arena.direction,
            capacity: ELE_MAX,
        };
        let link = u8::try_from(HARD_MAX + block).map_err(|_| exhausted)?;
        self.write(arena, table, index, link);
        Ok(Table::Block(block))
    }

    fn fill(
        &mut self,
        arena: &mut ElementArena,
        table: Table,
        from: i64,
        to: i64,
        mask: i64,
        value: u8,
    ) {
        for index in from..=to {
            self.write(arena, table, index & mask, value);
        }
    }

    fn cell(&self, arena: &ElementArena, table: Table, index: i64) -> u8 {
        let Ok(index) = usize::try_from(index) else {
            return HandlerId::UNMAPPED.get();
        };
        match table {
            Table::Root => self.level0.get(index),
            Table::Block(block) => arena.cells.get(block * SUB_BLOCK_CELLS + index),
        }
        .copied()
        .unwrap_or(HandlerId::UNMAPPED.get())
    }

    fn write(&mut self, arena: &mut ElementArena, table: Table, index: i64, value: u8) {
        let Ok(index) = usize::try_from(index) else {
            return;
        };
        let cell = match table {
            Table::Root => self.level0.get_mut(index),
            Table::Block(block) => arena.cells.get_mut(block * SUB_BLOCK_CELLS + index),
        };
        if let Some(cell) = cell {
            *cell = value;
        }
    }

    /// Contiguous `(start, end, id)` runs covering the whole address space.
    #[must_use]
    pub fn spans(&self, arena: &ElementArena) -> Vec<(u32, u32, HandlerId)> {
        let mut spans: Vec<(u64, u64, HandlerId)> = Vec::new();
        let mut push = |start: u64, end: u64, id: HandlerId| match spans.last_mut() {
            Some(last) if last.2 == id && last.1 + 1 == start => last.1 = end,
            _ => spans.push((start, end, id)),
        };

        let cell_span = 1_u64 << self.level0_shift;
        let sub_span = 1_u64 << self.min_bits;
        for (index, &cell) in self.level0.iter().enumerate() {
            let base = index as u64 * cell_span;
            if let Some(id) = HandlerId::from_cell(cell) {
                push(base, base + cell_span - 1, id);
                continue;
            }
            let block = usize::from(cell) - HARD_MAX;
            for sub in 0..=self.level1_mask as usize {
                let cell = arena
                    .cells
                    .get(block * SUB_BLOCK_CELLS + sub)
                    .copied()
                    .and_then(HandlerId::from_cell)
                    .unwrap_or(HandlerId::UNMAPPED);
                let start = base + sub as u64 * sub_span;
                push(start, start + sub_span - 1, cell);
            }
        }

        spans
            .into_iter()
            .filter_map(|(start, end, id)| {
                let start = u32::try_from(start).ok()?;
                Some((start, u32::try_from(end).ok()?, id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ElementArena, ElementMap, ELE_MAX};
    use crate::bus::{BUS_16, BUS_24};
    use crate::handler::{Direction, HandlerId};
    use crate::MemoryError;

    fn id(raw: u8) -> HandlerId {
        HandlerId::from_cell(raw).expect("id")
    }

    fn install(map: &mut ElementMap, arena: &mut ElementArena, start: u32, end: u32, to: u8) {
        map.install(arena, start, end, id(to)).expect("install");
    }

    #[test]
    fn fresh_map_is_unmapped() {
        let map = ElementMap::new(&BUS_16);
        let arena = ElementArena::new(Direction::Read);
        assert_eq!(map.resolve(&arena, 0x0000), HandlerId::UNMAPPED);
        assert_eq!(map.resolve(&arena, 0xffff), HandlerId::UNMAPPED);
    }

    #[test]
    fn aligned_install_needs_no_blocks() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Read);
        install(&mut map, &mut arena, 0x4000, 0x7fff, 30);
        assert_eq!(arena.blocks_used(), 0);
        assert_eq!(map.resolve(&arena, 0x3fff), HandlerId::UNMAPPED);
        assert_eq!(map.resolve(&arena, 0x4000), id(30));
        assert_eq!(map.resolve(&arena, 0x7fff), id(30));
        assert_eq!(map.resolve(&arena, 0x8000), HandlerId::UNMAPPED);
    }

    #[test]
    fn single_address_splits_one_cell() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Read);
        install(&mut map, &mut arena, 0x0000, 0xffff, 30);
        install(&mut map, &mut arena, 0x4000, 0x4000, 31);
        assert_eq!(arena.blocks_used(), 1);
        assert_eq!(map.resolve(&arena, 0x3fff), id(30));
        assert_eq!(map.resolve(&arena, 0x4000), id(31));
        assert_eq!(map.resolve(&arena, 0x4001), id(30));
        assert_eq!(map.resolve(&arena, 0x400f), id(30));
        assert_eq!(map.resolve(&arena, 0x4010), id(30));
    }

    #[test]
    fn unaligned_range_splits_both_boundaries() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Write);
        install(&mut map, &mut arena, 0x0ff8, 0x1008, 40);
        assert_eq!(arena.blocks_used(), 2);
        assert_eq!(map.resolve(&arena, 0x0ff7), HandlerId::UNMAPPED);
        assert_eq!(map.resolve(&arena, 0x0ff8), id(40));
        assert_eq!(map.resolve(&arena, 0x0fff), id(40));
        assert_eq!(map.resolve(&arena, 0x1000), id(40));
        assert_eq!(map.resolve(&arena, 0x1008), id(40));
        assert_eq!(map.resolve(&arena, 0x1009), HandlerId::UNMAPPED);
    }

    #[test]
    fn refining_an_existing_block_reuses_it() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Read);
        install(&mut map, &mut arena, 0x1002, 0x1003, 40);
        install(&mut map, &mut arena, 0x1008, 0x100a, 41);
        assert_eq!(arena.blocks_used(), 1);
        assert_eq!(map.resolve(&arena, 0x1001), HandlerId::UNMAPPED);
        assert_eq!(map.resolve(&arena, 0x1003), id(40));
        assert_eq!(map.resolve(&arena, 0x1009), id(41));
        assert_eq!(map.resolve(&arena, 0x100b), HandlerId::UNMAPPED);
    }

    #[test]
    fn granularity_ignores_low_bits() {
        let mut map = ElementMap::new(&BUS_24);
        let mut arena = ElementArena::new(Direction::Read);
        install(&mut map, &mut arena, 0x00_1001, 0x00_1001, 25);
        assert_eq!(map.resolve(&arena, 0x00_1000), id(25));
        assert_eq!(map.resolve(&arena, 0x00_1001), id(25));
        assert_eq!(map.resolve(&arena, 0x00_1002), HandlerId::UNMAPPED);
    }

    #[test]
    fn empty_range_is_a_no_op() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Read);
        install(&mut map, &mut arena, 0x2000, 0x1fff, 30);
        assert_eq!(map.resolve(&arena, 0x2000), HandlerId::UNMAPPED);
        assert_eq!(map.resolve(&arena, 0x1fff), HandlerId::UNMAPPED);
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Read);
        for cell in 0..64_u32 {
            install(&mut map, &mut arena, cell << 4, cell << 4, 30);
        }
        assert_eq!(arena.blocks_used(), ELE_MAX);
        assert_eq!(
            map.install(&mut arena, 0x8000, 0x8000, id(30)),
            Err(MemoryError::ElementArenaExhausted {
                direction: Direction::Read,
                capacity: ELE_MAX
            })
        );
    }

    #[test]
    fn spans_merge_adjacent_cells() {
        let mut map = ElementMap::new(&BUS_16);
        let mut arena = ElementArena::new(Direction::Read);
        install(&mut map, &mut arena, 0x0000, 0x3fff, 20);
        install(&mut map, &mut arena, 0x4000, 0x4002, 0);
        assert_eq!(
            map.spans(&arena),
            vec![
                (0x0000, 0x3fff, id(20)),
                (0x4000, 0x4002, id(0)),
                (0x4003, 0xffff, HandlerId::UNMAPPED),
            ]
        );
    }
}
