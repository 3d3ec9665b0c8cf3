// set-associative block storage with LRU per row

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::commons::{Addr, MemEvent, Source};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockStatus {
    /// no valid data; block is reusable
    Invalid,
    /// reserved for an in-flight load; data not yet valid
    Assigned,
    /// clean, may be read-shared with peers and the level below
    Shared,
    /// clean, sole owner above memory; writes need no peer notification
    Exclusive,
    /// modified data that must be written back
    Dirty,
}

impl BlockStatus {
    pub fn short(&self) -> &'static str {
        match self {
            BlockStatus::Invalid => "I",
            BlockStatus::Assigned => "A",
            BlockStatus::Shared => "S",
            BlockStatus::Exclusive => "E",
            BlockStatus::Dirty => "D",
        }
    }
}

pub struct CacheBlock {
    pub base_addr: Addr,
    pub tag: Addr,
    pub row: usize,
    pub col: usize,
    pub status: BlockStatus,
    pub data: Vec<u8>,
    pub last_touched: u64,
    /// protocol lock; non-zero means the block may not be re-used
    locked: u32,
    /// CPU atomic-lock depth
    pub user_locked: u32,
    /// writeback deferred until the user lock drops to zero
    pub user_lock_needs_wb: bool,
    pub wb_in_progress: bool,
    /// key of the outstanding load targeting this block, re-looked-up on use
    pub load_info: Option<Addr>,
}

impl CacheBlock {
    pub fn new(row: usize, col: usize, blocksize: u32) -> Self {
        CacheBlock {
            base_addr: 0,
            tag: 0,
            row,
            col,
            status: BlockStatus::Invalid,
            data: vec![0; blocksize as usize],
            last_touched: 0,
            locked: 0,
            user_locked: 0,
            user_lock_needs_wb: false,
            wb_in_progress: false,
            load_info: None,
        }
    }
    pub fn is_valid(&self) -> bool {
        self.status != BlockStatus::Invalid && self.status != BlockStatus::Assigned
    }
    pub fn is_invalid(&self) -> bool {
        self.status == BlockStatus::Invalid
    }
    pub fn is_assigned(&self) -> bool {
        self.status == BlockStatus::Assigned
    }
    pub fn is_locked(&self) -> bool {
        self.locked > 0
    }
    pub fn lock(&mut self) {
        self.locked += 1;
    }
    pub fn unlock(&mut self) {
        assert!(self.locked > 0, "unlock of an unlocked block");
        self.locked -= 1;
    }
    /// reserve the block for an in-flight load of `base_addr`
    pub fn activate(&mut self, base_addr: Addr, tag: Addr) {
        self.base_addr = base_addr;
        self.tag = tag;
        self.status = BlockStatus::Assigned;
        self.user_locked = 0;
        self.user_lock_needs_wb = false;
        self.wb_in_progress = false;
    }
}

pub type EventQueue = VecDeque<(MemEvent, Source)>;

pub struct CacheRow {
    pub blocks: Vec<CacheBlock>,
    /// events parked until this row frees a slot or a block settles
    pub waiting_events: HashMap<Addr, EventQueue>,
}

impl CacheRow {
    pub fn new(row: usize, ways: u32, blocksize: u32) -> Self {
        CacheRow {
            blocks: (0..ways as usize)
                .map(|c| CacheBlock::new(row, c, blocksize))
                .collect(),
            waiting_events: HashMap::new(),
        }
    }
    /// least-recently-touched unlocked block, invalid slots first; None
    /// when every way is locked
    pub fn get_lru(&self) -> Option<usize> {
        if let Some(b) = self
            .blocks
            .iter()
            .find(|b| b.is_invalid() && !b.is_locked())
        {
            return Some(b.col);
        }
        self.blocks
            .iter()
            .filter(|b| !b.is_locked())
            .min_by_key(|b| b.last_touched)
            .map(|b| b.col)
    }
    pub fn add_waiting_event(&mut self, ev: MemEvent, src: Source) {
        self.waiting_events
            .entry(ev.base_addr)
            .or_default()
            .push_back((ev, src));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::MemCmd;

    #[test]
    fn test_lru_prefers_invalid_slots() {
        let mut row = CacheRow::new(0, 2, 64);
        row.blocks[0].status = BlockStatus::Shared;
        row.blocks[0].last_touched = 1;
        assert_eq!(row.get_lru(), Some(1));
    }

    #[test]
    fn test_lru_skips_locked_blocks() {
        let mut row = CacheRow::new(0, 2, 64);
        for b in row.blocks.iter_mut() {
            b.status = BlockStatus::Shared;
        }
        row.blocks[0].last_touched = 1;
        row.blocks[1].last_touched = 5;
        assert_eq!(row.get_lru(), Some(0));

        row.blocks[0].lock();
        assert_eq!(row.get_lru(), Some(1));
        row.blocks[1].lock();
        assert_eq!(row.get_lru(), None);
        row.blocks[0].unlock();
        assert_eq!(row.get_lru(), Some(0));
    }

    #[test]
    fn test_assigned_is_not_a_hit() {
        let mut b = CacheBlock::new(0, 0, 64);
        b.activate(0x100, 2);
        assert!(!b.is_valid());
        assert!(b.is_assigned());
    }

    #[test]
    fn test_waiting_events_group_by_block() {
        let mut row = CacheRow::new(0, 2, 64);
        let mut ev = MemEvent::new((1, 0), "cpu0", 0x104, MemCmd::ReadReq);
        ev.base_addr = 0x100;
        row.add_waiting_event(ev, Source::Upstream);
        let mut ev = MemEvent::new((2, 0), "cpu0", 0x108, MemCmd::ReadReq);
        ev.base_addr = 0x100;
        row.add_waiting_event(ev, Source::Upstream);
        assert_eq!(row.waiting_events.len(), 1);
        assert_eq!(row.waiting_events[&0x100].len(), 2);
    }
}
