// bookkeeping tables for in-flight transactions, keyed by block address

use std::collections::VecDeque;

use crate::cache::storage::BlockStatus;
use crate::commons::{Addr, EventId, ForwardDir, MemEvent, Source, NO_ID};

/// one queued reason to finish an outstanding load
pub struct LoadElement {
    pub ev: Option<MemEvent>,
    pub src: Source,
    pub issue_time: u64,
}

/// an outstanding load; concurrent misses on the same block coalesce here
pub struct LoadInfo {
    pub addr: Addr,
    pub initiating_event: EventId,
    /// (row, col) once a slot has been reserved
    pub target: Option<(usize, usize)>,
    pub direction: ForwardDir,
    pub list: VecDeque<LoadElement>,
    /// in-flight bus request, cancellable while still queued
    pub bus_event: Option<EventId>,
}

impl LoadInfo {
    pub fn new(addr: Addr) -> Self {
        LoadInfo {
            addr,
            initiating_event: NO_ID,
            target: None,
            direction: ForwardDir::Down,
            list: VecDeque::new(),
            bus_event: None,
        }
    }
}

/// a pending invalidate broadcast, extinguished when every ACK is in
pub struct Invalidation {
    pub issuing_event: EventId,
    /// locked target block, when the invalidate has one
    pub block: Option<(usize, usize)>,
    pub new_status: Option<BlockStatus>,
    pub waiting_acks: u32,
    pub can_cancel: bool,
    pub bus_event: Option<EventId>,
    pub waiting_events: VecDeque<(MemEvent, Source)>,
}

impl Default for Invalidation {
    fn default() -> Self {
        Invalidation {
            issuing_event: NO_ID,
            block: None,
            new_status: None,
            waiting_acks: 0,
            can_cancel: true,
            bus_event: None,
            waiting_events: VecDeque::new(),
        }
    }
}

/// an in-flight supply for one (block, peer) pair
pub struct SupplyInfo {
    pub bus_event: Option<EventId>,
    pub canceled: bool,
}

impl SupplyInfo {
    pub fn new() -> Self {
        SupplyInfo {
            bus_event: None,
            canceled: false,
        }
    }
}

/// directory controller descriptor snapshotted from the network at setup
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub range_start: Addr,
    pub range_end: Addr,
    pub interleave_size: u64,
    pub interleave_step: u64,
    pub name: String,
}
