/*
    The cache controller: set-associative storage, a coherence state
    machine per block, tables for outstanding loads / invalidations /
    supplies, and the re-entrant event dispatcher tying them together.

    Every handler runs to completion; deferred work re-enters through the
    self link as a tagged `SelfAction`.
 */

pub mod storage;
pub mod tables;

use std::collections::HashMap;

use log::{debug, warn};

use crate::bus::{BusHandlers, SnoopBusQueue};
use crate::commons::{
    Addr, CacheMode, CacheParams, ConfigError, EventId, ForwardDir, MemCmd, MemEvent, MemFlags,
    Msg, MsgHandler, Source, Wire,
};
use crate::delayed_q::{DelQSender, DelayedMsg};
use crate::fatal;

use storage::{BlockStatus, CacheRow};
use tables::{DirEntry, Invalidation, LoadElement, LoadInfo, SupplyInfo};

type DelQMsgSender = DelQSender<Msg>;

/// point-to-point wire latency, in simulation time units
const LINK_DELAY: u64 = 1;

// prefetcher surface

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessResult {
    Hit,
    Miss,
}

pub trait CacheListener {
    fn notify_access(&mut self, _kind: AccessKind, _result: AccessResult, _addr: Addr) {}
    /// requests the listener wants injected, drained after each notify
    fn take_requests(&mut self) -> Vec<MemEvent> {
        Vec::new()
    }
}

pub struct NullListener;
impl CacheListener for NullListener {}

pub fn load_listener(name: &str) -> Result<Box<dyn CacheListener>, ConfigError> {
    match name {
        "" => Ok(Box::new(NullListener)),
        other => Err(ConfigError::UnknownPrefetcher(other.to_string())),
    }
}

// messages

pub enum CacheMsg {
    /// arrival on one of the link surfaces
    Link(MemEvent, Source),
    /// deferred work re-entering through the self link
    SelfEvent(SelfAction),
}

/// deferred-action shapes carried by self-events
pub enum SelfAction {
    Retry(MemEvent, Source),
    CpuResponse(MemEvent),
    Supply(MemEvent, (usize, usize), Source),
    FinishLoad(Addr, EventId),
    Prefetch(MemEvent),
}

/// fired just before a granted bus send goes on the wire
pub enum BusInitAction {
    SupplyPayload {
        row: usize,
        col: usize,
        fake: bool,
    },
    WritebackPayload {
        row: usize,
        col: usize,
    },
}

/// fired once a granted bus send has gone on the wire
pub enum BusFinishAction {
    LoadIssued {
        addr: Addr,
    },
    SupplySent {
        addr: Addr,
        row: usize,
        col: usize,
        src: Source,
        fake: bool,
    },
    WritebackDone {
        row: usize,
        col: usize,
        new_status: BlockStatus,
    },
}

// link configuration

#[derive(Default)]
pub struct CacheLinks {
    /// CPU, if present, is always upstream link 0
    pub upstream: Vec<Wire>,
    pub downstream: Option<Wire>,
    pub directory: bool,
}

// statistics

#[derive(Default)]
pub struct CacheStats {
    pub num_read_hit: u64,
    pub num_read_miss: u64,
    pub num_write_hit: u64,
    pub num_write_miss: u64,
    pub num_supply_hit: u64,
    pub num_supply_miss: u64,
    pub num_upgrade_miss: u64,
}

// the cache

pub struct Cache {
    name: String,
    /// our index in the system, for self-addressed messages
    idx: usize,
    /// component number stamped into event ids
    comp: u32,
    params: CacheParams,
    tx: DelQMsgSender,
    links: CacheLinks,
    rowshift: u32,
    rowmask: u64,
    tagshift: u32,
    database: Vec<CacheRow>,
    waiting_loads: HashMap<Addr, LoadInfo>,
    invalidations: HashMap<Addr, Invalidation>,
    supply_in_progress: HashMap<(Addr, Source), SupplyInfo>,
    snoop_bus: Option<SnoopBusQueue<BusInitAction, BusFinishAction>>,
    directories: Vec<DirEntry>,
    listener: Box<dyn CacheListener>,
    /// detected on the first CPU request, or forced by config
    is_l1: bool,
    stats: CacheStats,
}

impl Cache {
    pub fn new(
        idx: usize,
        comp: u32,
        name: &str,
        params: CacheParams,
        links: CacheLinks,
        listener: Box<dyn CacheListener>,
        tx: DelQMsgSender,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        let rowshift = params.blocksize.trailing_zeros();
        let rowmask = (params.num_rows - 1) as u64;
        let tagshift = rowshift + params.num_rows.trailing_zeros();
        let database = (0..params.num_rows as usize)
            .map(|r| CacheRow::new(r, params.num_ways, params.blocksize))
            .collect();
        Ok(Cache {
            name: name.to_string(),
            idx,
            comp,
            is_l1: params.is_l1,
            params,
            tx,
            links,
            rowshift,
            rowmask,
            tagshift,
            database,
            waiting_loads: HashMap::new(),
            invalidations: HashMap::new(),
            supply_in_progress: HashMap::new(),
            snoop_bus: None,
            directories: Vec::new(),
            listener,
            stats: CacheStats::default(),
        })
    }

    pub fn connect_snoop(&mut self, port: usize) {
        self.snoop_bus = Some(SnoopBusQueue::new(port, self.tx.clone()));
    }

    /// snapshot of the directory controllers learned from the network
    pub fn set_directory_peers(&mut self, peers: Vec<DirEntry>) {
        self.directories = peers;
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
    /// status of the block covering `addr`, Assigned included
    pub fn block_status(&self, addr: Addr) -> Option<BlockStatus> {
        let tag = self.addr_to_tag(addr);
        self.database[self.find_row(addr)]
            .blocks
            .iter()
            .find(|b| !b.is_invalid() && b.tag == tag)
            .map(|b| b.status)
    }
    pub fn block_data(&self, addr: Addr) -> Option<&[u8]> {
        self.find_block(addr, false)
            .map(|(r, c)| self.database[r].blocks[c].data.as_slice())
    }
    /// true once no transaction is outstanding
    pub fn quiescent(&self) -> bool {
        self.waiting_loads.is_empty()
            && self.invalidations.is_empty()
            && self.supply_in_progress.is_empty()
    }

    // address helpers

    fn addr_to_block_addr(&self, addr: Addr) -> Addr {
        addr & !((self.params.blocksize - 1) as Addr)
    }
    fn addr_to_tag(&self, addr: Addr) -> Addr {
        addr >> self.tagshift
    }
    fn find_row(&self, addr: Addr) -> usize {
        ((addr >> self.rowshift) & self.rowmask) as usize
    }
    /// (row, col) of a valid block matching the address; with `empty_ok`,
    /// an invalid block in the same row when there is no match
    fn find_block(&self, addr: Addr, empty_ok: bool) -> Option<(usize, usize)> {
        let row = self.find_row(addr);
        let tag = self.addr_to_tag(addr);
        for b in &self.database[row].blocks {
            if b.is_valid() && b.tag == tag {
                return Some((row, b.col));
            }
        }
        if empty_ok {
            for b in &self.database[row].blocks {
                if b.is_invalid() {
                    return Some((row, b.col));
                }
            }
        }
        None
    }

    // sending helpers

    fn next_id(&self) -> EventId {
        (self.tx.alloc_seq(), self.comp)
    }
    fn now(&self) -> u64 {
        self.tx.now()
    }
    fn send_wire(&self, wire: &Wire, ev: MemEvent) {
        self.tx.send(DelayedMsg {
            t: LINK_DELAY,
            msg: wire.deliver(ev),
        });
    }
    fn send_upstream(&self, link: usize, ev: MemEvent) {
        self.send_wire(&self.links.upstream[link], ev);
    }
    fn send_downstream(&self, ev: MemEvent) {
        match &self.links.downstream {
            Some(w) => self.send_wire(w, ev),
            None => fatal!("{}: no downstream link", self.name),
        }
    }
    fn send_directory(&self, ev: MemEvent) {
        self.tx.send(DelayedMsg {
            t: LINK_DELAY,
            msg: Msg::ToDirectory(self.idx, ev),
        });
    }
    /// deferred self-delivery after `units` × access_time
    fn send_self(&self, action: SelfAction, units: u64) {
        self.tx.send(DelayedMsg {
            t: units * self.params.access_time,
            msg: Msg::ToCache(self.idx, CacheMsg::SelfEvent(action)),
        });
    }

    fn listener_notify(&mut self, kind: AccessKind, result: AccessResult, addr: Addr) {
        self.listener.notify_access(kind, result, addr);
        for req in self.listener.take_requests() {
            self.send_self(SelfAction::Prefetch(req), 1);
        }
    }

    // dispatcher

    fn handle_self_event(&mut self, action: SelfAction) {
        match action {
            SelfAction::Retry(ev, src) => self.handle_incoming(ev, src, false, false),
            SelfAction::CpuResponse(ev) => self.send_cpu_response(ev),
            SelfAction::Supply(ev, block, src) => self.supply_data(ev, block, src),
            SelfAction::FinishLoad(addr, load_id) => self.finish_load_block(addr, load_id),
            SelfAction::Prefetch(ev) => self.handle_incoming(ev, Source::Prefetcher, true, false),
        }
    }

    fn handle_incoming(
        &mut self,
        mut ev: MemEvent,
        src: Source,
        first_time_processed: bool,
        first_phase_complete: bool,
    ) {
        debug!(
            "{}: received ({}, {}) ({} to {} (link {})) {:?} 0x{:x} from {}",
            self.name, ev.id.0, ev.id.1, ev.src, ev.dst, ev.link_id, ev.cmd, ev.addr, src
        );
        ev.base_addr = self.addr_to_block_addr(ev.addr);
        match ev.cmd {
            MemCmd::BusClearToSend => self.bus_clear_to_send(),
            MemCmd::ReadReq | MemCmd::WriteReq => {
                self.handle_cpu_request(ev, src, first_time_processed)
            }
            MemCmd::RequestData => self.handle_cache_request(ev, src, first_time_processed),
            MemCmd::SupplyData => self.handle_cache_supply(ev, src),
            MemCmd::Invalidate => self.handle_invalidate(ev, src, first_phase_complete),
            MemCmd::ACK => self.ack_invalidate(ev),
            MemCmd::NACK => self.handle_nack(ev, src),
            MemCmd::Fetch => self.handle_fetch(ev, false, first_phase_complete),
            MemCmd::FetchInvalidate => self.handle_fetch(ev, true, first_phase_complete),
        }
    }

    // snoop bus gate

    fn bus_clear_to_send(&mut self) {
        let pending = match self.snoop_bus.as_mut() {
            Some(bus) => bus.clear_to_send(),
            None => fatal!("{}: bus grant without a snoop link", self.name),
        };
        let Some(mut pending) = pending else {
            return;
        };
        if let Some(init) = pending.init.take() {
            self.run_bus_init(init, &mut pending.ev);
        }
        self.snoop_bus.as_ref().unwrap().send(pending.ev);
        if let Some(finish) = pending.finish.take() {
            self.run_bus_finish(finish);
        }
    }

    fn run_bus_init(&self, init: BusInitAction, ev: &mut MemEvent) {
        match init {
            BusInitAction::SupplyPayload { row, col, fake } => {
                // refresh from the block at actual send time
                if !fake {
                    ev.payload = self.database[row].blocks[col].data.clone();
                }
            }
            BusInitAction::WritebackPayload { row, col } => {
                ev.payload = self.database[row].blocks[col].data.clone();
            }
        }
    }

    fn run_bus_finish(&mut self, finish: BusFinishAction) {
        match finish {
            BusFinishAction::LoadIssued { addr } => {
                if let Some(li) = self.waiting_loads.get_mut(&addr) {
                    li.bus_event = None;
                }
            }
            BusFinishAction::SupplySent {
                addr,
                row,
                col,
                src,
                fake,
            } => {
                debug!("{}: supply message sent for block 0x{:x}", self.name, addr);
                if !fake {
                    self.database[row].blocks[col].status = BlockStatus::Shared;
                }
                if self.supply_in_progress.remove(&(addr, src)).is_none() {
                    fatal!("{}: finished supply of 0x{:x} with no record", self.name, addr);
                }
            }
            BusFinishAction::WritebackDone {
                row,
                col,
                new_status,
            } => {
                self.finish_writeback_block(row, col, new_status, true);
            }
        }
    }

    // CPU requests

    fn handle_cpu_request(&mut self, ev: MemEvent, src: Source, first: bool) {
        self.is_l1 = true;
        let is_read = ev.cmd == MemCmd::ReadReq;
        let block = self.find_block(ev.addr, false);
        debug!(
            "{}: ({}, {}) 0x{:x}{} {} {} (block 0x{:x})",
            self.name,
            ev.id.0,
            ev.id.1,
            ev.addr,
            if ev.query_flag(MemFlags::LOCKED) { " [LOCKED]" } else { "" },
            if is_read { "READ" } else { "WRITE" },
            if block.is_some() { "HIT" } else { "MISS" },
            ev.base_addr,
        );

        if first {
            self.listener_notify(
                if is_read { AccessKind::Read } else { AccessKind::Write },
                if block.is_some() { AccessResult::Hit } else { AccessResult::Miss },
                ev.addr,
            );
        }

        let Some((row, col)) = block else {
            if ev.query_flag(MemFlags::LOCKED) && !is_read {
                fatal!("{}: locked write missed; the lock should have pinned 0x{:x}", self.name, ev.addr);
            }
            if first {
                if is_read {
                    self.stats.num_read_miss += 1;
                } else {
                    self.stats.num_write_miss += 1;
                }
            }
            self.load_block(ev, src);
            return;
        };

        let base = self.database[row].blocks[col].base_addr;
        self.database[row].blocks[col].last_touched = self.now();

        if is_read {
            if first {
                self.stats.num_read_hit += 1;
            }
            if self.waiting_for_invalidate(base) {
                debug!("{}: invalidation for this in progress, queueing", self.name);
                self.invalidations
                    .get_mut(&base)
                    .unwrap()
                    .waiting_events
                    .push_back((ev, src));
                return;
            }
            if ev.query_flag(MemFlags::LOCKED)
                && self.database[row].blocks[col].status != BlockStatus::Exclusive
            {
                self.issue_invalidate_block(
                    ev,
                    src,
                    (row, col),
                    BlockStatus::Exclusive,
                    ForwardDir::Both,
                    true,
                );
                return;
            }
            if ev.query_flag(MemFlags::LOCKED) {
                let wb = self.database[row].blocks[col].wb_in_progress;
                let supplying = self
                    .supply_in_progress
                    .get(&(base, Source::Snoop))
                    .map(|s| !s.canceled)
                    .unwrap_or(false);
                if wb || supplying {
                    // still exclusive, but an in-flight writeback or supply
                    // will demote the block; retry once it has drained
                    debug!("{}: WB or supply in progress, retrying locked read", self.name);
                    self.send_self(SelfAction::Retry(ev, src), 1);
                    return;
                }
                let b = &mut self.database[row].blocks[col];
                b.user_locked += 1;
                b.user_lock_needs_wb = false;
            }
            let resp = self.make_cpu_response(&ev, (row, col));
            self.send_self(SelfAction::CpuResponse(resp), 1);
        } else {
            if ev.query_flag(MemFlags::LOCKED)
                && self.database[row].blocks[col].status != BlockStatus::Exclusive
            {
                fatal!("{}: locked write hit a non-exclusive block 0x{:x}", self.name, base);
            }
            if self.database[row].blocks[col].status == BlockStatus::Exclusive {
                if first {
                    self.stats.num_write_hit += 1;
                }
                self.update_block(&ev, (row, col));
                let resp = self.make_cpu_response(&ev, (row, col));
                self.send_self(SelfAction::CpuResponse(resp), 1);
                let b = &mut self.database[row].blocks[col];
                if b.user_locked > 0 && ev.query_flag(MemFlags::LOCKED) {
                    // unlock
                    b.user_locked -= 1;
                    if b.user_locked == 0 && b.user_lock_needs_wb {
                        self.writeback_block((row, col), BlockStatus::Shared);
                    }
                }
            } else {
                if first {
                    self.stats.num_upgrade_miss += 1;
                }
                if self.waiting_for_invalidate(base) {
                    debug!("{}: invalidation for this in progress, queueing", self.name);
                    self.invalidations
                        .get_mut(&base)
                        .unwrap()
                        .waiting_events
                        .push_back((ev, src));
                } else {
                    self.issue_invalidate_block(
                        ev,
                        src,
                        (row, col),
                        BlockStatus::Exclusive,
                        ForwardDir::Both,
                        true,
                    );
                }
            }
        }
    }

    fn make_cpu_response(&self, ev: &MemEvent, (row, col): (usize, usize)) -> MemEvent {
        let block = &self.database[row].blocks[col];
        let offset = ev.addr - block.base_addr;
        if offset + ev.size as u64 > self.params.blocksize as u64 {
            fatal!(
                "{}: split requests unsupported: addr 0x{:x} offset {} size {} blocksize {}",
                self.name,
                ev.addr,
                offset,
                ev.size,
                self.params.blocksize
            );
        }
        let mut resp = ev.make_response(self.next_id(), &self.name);
        if ev.cmd == MemCmd::ReadReq {
            resp.payload = block.data[offset as usize..(offset + ev.size as u64) as usize].to_vec();
        }
        debug!(
            "{}: response ({}, {}) to ({}, {}) [{:?} 0x{:x}]",
            self.name, resp.id.0, resp.id.1, resp.response_to.0, resp.response_to.1, resp.cmd, resp.addr
        );
        resp
    }

    fn send_cpu_response(&mut self, ev: MemEvent) {
        debug!(
            "{}: sending CPU response {:?} 0x{:x} ({}, {})",
            self.name, ev.cmd, ev.addr, ev.id.0, ev.id.1
        );
        let row = self.find_row(ev.addr);
        // CPU is always upstream link 0
        self.send_upstream(0, ev);
        // release events pending on this row
        self.handle_pending_events(row, None);
    }

    // invalidation protocol

    fn waiting_for_invalidate(&self, addr: Addr) -> bool {
        self.invalidations.contains_key(&addr)
    }

    fn issue_invalidate_block(
        &mut self,
        ev: MemEvent,
        src: Source,
        (row, col): (usize, usize),
        new_status: BlockStatus,
        direction: ForwardDir,
        cancelable: bool,
    ) {
        self.database[row].blocks[col].lock();
        let base = self.database[row].blocks[col].base_addr;
        let inv = self.invalidations.entry(base).or_default();
        inv.block = Some((row, col));
        inv.new_status = Some(new_status);
        self.issue_invalidate(ev, src, base, direction, cancelable);
    }

    fn issue_invalidate(
        &mut self,
        ev: MemEvent,
        src: Source,
        addr: Addr,
        direction: ForwardDir,
        cancelable: bool,
    ) {
        debug!("{}: enqueuing request to invalidate block 0x{:x}", self.name, addr);
        let inv_id = self.next_id();
        let trigger_link = ev.link_id;
        let trigger_base = ev.base_addr;
        {
            let inv = self.invalidations.entry(addr).or_default();
            inv.waiting_events.push_back((ev, src));
            inv.waiting_acks = 0;
            inv.can_cancel = cancelable;
            inv.issuing_event = inv_id;
        }

        let mut inv_ev = MemEvent::new(inv_id, &self.name, addr, MemCmd::Invalidate);
        inv_ev.base_addr = addr;
        let mut acks = 0u32;

        if let Some(bus) = self.snoop_bus.as_mut() {
            bus.request(inv_ev.clone(), None, None);
            acks += 1;
            self.invalidations.get_mut(&addr).unwrap().bus_event = Some(inv_id);
        }

        if direction == ForwardDir::Down || direction == ForwardDir::Both {
            if self.links.downstream.is_some() && self.params.next_level.is_some() {
                self.send_downstream(inv_ev.clone());
                acks += 1;
            }
            if self.links.directory {
                let mut e = inv_ev.clone();
                e.dst = self.find_target_directory(addr);
                self.send_directory(e);
                acks += 1;
            }
        }

        if direction == ForwardDir::Up || direction == ForwardDir::Both {
            for i in 0..self.links.upstream.len() {
                // don't invalidate whoever sent the triggering command,
                // except when evicting a block other than the trigger's
                if src == Source::Upstream && trigger_link == i && trigger_base == addr {
                    continue;
                }
                self.send_upstream(i, inv_ev.clone());
                acks += 1;
            }
        }

        debug!("{}: expecting {} acknowledgments", self.name, acks);
        self.invalidations.get_mut(&addr).unwrap().waiting_acks = acks;
        if acks == 0 {
            // nobody to wait for
            self.finish_issue_invalidate(addr);
        }
    }

    fn finish_issue_invalidate(&mut self, addr: Addr) {
        let inv = self.invalidations.remove(&addr).unwrap();
        assert!(inv.waiting_acks == 0);

        if let Some((row, col)) = inv.block {
            let b = &mut self.database[row].blocks[col];
            b.unlock();
            if let Some(status) = inv.new_status {
                b.status = status;
            }
        }
        debug!("{}: received all invalidate ACKs for block 0x{:x}", self.name, addr);

        // record erased above, before replay; handlers must not think the
        // invalidation is still pending
        let mut first = true;
        for (ev, src) in inv.waiting_events {
            debug!(
                "{}: handling formerly blocked event ({}, {}) [{:?} 0x{:x}]",
                self.name, ev.id.0, ev.id.1, ev.cmd, ev.addr
            );
            self.handle_incoming(ev, src, false, first);
            first = false;
        }
    }

    /// returns false when the invalidation is not cancelable
    fn cancel_invalidate(&mut self, addr: Addr) -> bool {
        if !self.invalidations[&addr].can_cancel {
            debug!("{}: cannot cancel invalidate 0x{:x}", self.name, addr);
            return false;
        }
        debug!("{}: attempting cancel for invalidate 0x{:x}", self.name, addr);
        let inv = self.invalidations.remove(&addr).unwrap();
        if let (Some(bus_ev), Some(bus)) = (inv.bus_event, self.snoop_bus.as_mut()) {
            bus.cancel_request(bus_ev);
        }
        // only unlock what we locked when the invalidate was issued
        if let Some((row, col)) = inv.block {
            self.database[row].blocks[col].unlock();
        }
        debug!(
            "{}: due to cancel of invalidate 0x{:x}, re-issuing {} events",
            self.name,
            addr,
            inv.waiting_events.len()
        );
        for (ev, src) in inv.waiting_events {
            self.send_self(SelfAction::Retry(ev, src), 1);
        }
        true
    }

    fn ack_invalidate(&mut self, ev: MemEvent) {
        let addr = ev.base_addr;
        let matches = self
            .invalidations
            .get(&addr)
            .map(|inv| ev.response_to == inv.issuing_event || ev.src == self.name)
            .unwrap_or(false);
        if !matches {
            debug!("{}: we aren't waiting for this ACK, ignoring", self.name);
            return;
        }
        let inv = self.invalidations.get_mut(&addr).unwrap();
        if inv.waiting_acks == 0 {
            fatal!("{}: ACK underflow for invalidation of 0x{:x}", self.name, addr);
        }
        inv.waiting_acks -= 1;
        debug!(
            "{}: acknowledging an invalidate [{} remain]",
            self.name, inv.waiting_acks
        );
        if inv.waiting_acks == 0 {
            self.finish_issue_invalidate(addr);
        }
    }

    fn send_invalidate_ack(&mut self, ev: &MemEvent, src: Source) {
        let resp = ev.make_response(self.next_id(), &self.name);
        debug!(
            "{}: sending ACK for {:?} 0x{:x} to {}",
            self.name, ev.cmd, ev.addr, resp.dst
        );
        match src {
            Source::Upstream => self.send_upstream(ev.link_id, resp),
            Source::Downstream => self.send_downstream(resp),
            Source::Directory => self.send_directory(resp),
            Source::Snoop => fatal!("{}: we don't ACK on snoop", self.name),
            Source::SelfLink | Source::Prefetcher => {
                fatal!("{}: invalid ACK target {}", self.name, src)
            }
        }
    }

    fn handle_invalidate(&mut self, ev: MemEvent, src: Source, finished_upstream: bool) {
        if src == Source::Snoop && ev.src == self.name {
            // our own broadcast coming back around the bus
            self.ack_invalidate(ev);
            return;
        }

        let block = self.find_block(ev.addr, false);
        if let Some((row, col)) = block {
            let base = self.database[row].blocks[col].base_addr;
            if self.waiting_for_invalidate(base) {
                // should cause a re-issue of the blocked write
                if !self.cancel_invalidate(base) {
                    // an un-cancelable invalidate is in progress, retry later
                    self.send_self(SelfAction::Retry(ev, src), 2);
                    return;
                }
            }
        }

        if !finished_upstream
            && (src == Source::Downstream || src == Source::Directory)
            && !self.is_l1
        {
            debug!("{}: forwarding invalidate 0x{:x} on upstream", self.name, ev.addr);
            let addr = ev.base_addr;
            self.issue_invalidate(ev, src, addr, ForwardDir::Up, false);
            return;
        }
        if !finished_upstream && src == Source::Upstream {
            debug!("{}: forwarding invalidate 0x{:x} downstream", self.name, ev.addr);
            let addr = ev.base_addr;
            self.issue_invalidate(ev, src, addr, ForwardDir::Down, true);
            return;
        }

        if let Some((row, col)) = block {
            let base = self.database[row].blocks[col].base_addr;
            if self.database[row].blocks[col].status == BlockStatus::Shared {
                debug!("{}: invalidating block 0x{:x}", self.name, base);
                // if we're trying to supply this block, cancel that
                if let Some(sup) = self.supply_in_progress.get_mut(&(base, Source::Snoop)) {
                    sup.canceled = true;
                    if let Some(bus_ev) = sup.bus_event.take() {
                        debug!("{}: canceling bus request for supply on 0x{:x}", self.name, base);
                        self.snoop_bus.as_mut().unwrap().cancel_request(bus_ev);
                    }
                }
                let b = &mut self.database[row].blocks[col];
                if self.params.mode == CacheMode::Inclusive
                    && src != Source::Downstream
                    && src != Source::Directory
                {
                    // we still must write back before ack'ing the
                    // invalidate coming from below
                    b.status = BlockStatus::Dirty;
                    debug!("{}: marking block 0x{:x} as DIRTY", self.name, base);
                } else {
                    b.status = BlockStatus::Invalid;
                }
                self.handle_pending_events(row, None);
            }
            if self.database[row].blocks[col].status == BlockStatus::Exclusive {
                debug!(
                    "{}: invalidating EXCLUSIVE block 0x{:x} -> writeback, pend invalidate",
                    self.name, base
                );
                self.database[row].add_waiting_event(ev, src);
                self.writeback_block((row, col), BlockStatus::Invalid);
                return;
            }
        }

        if src != Source::Snoop {
            self.send_invalidate_ack(&ev, src);
        }
    }

    // peer requests (RequestData)

    fn handle_cache_request(&mut self, ev: MemEvent, src: Source, first: bool) {
        if src == Source::Snoop && ev.src == self.name {
            return; // we sent it
        }
        let block = self.find_block(ev.addr, false);
        debug!(
            "{}: 0x{:x} {} (block 0x{:x})",
            self.name,
            ev.addr,
            if block.is_some() { "HIT" } else { "MISS" },
            ev.base_addr,
        );
        if ev.size != self.params.blocksize {
            fatal!(
                "{}: cache line sizes differ ({} != {}); unsupported",
                self.name,
                ev.size,
                self.params.blocksize
            );
        }

        let Some((row, col)) = block else {
            if src == Source::Downstream {
                // a race with a recent writeback; the level below will cope
                debug!("{}: DOWNSTREAM request miss for 0x{:x}, ignoring", self.name, ev.addr);
                return;
            }
            if src != Source::Snoop || ev.dst == self.name {
                if first {
                    self.listener_notify(AccessKind::Read, AccessResult::Miss, ev.addr);
                    self.stats.num_supply_miss += 1;
                }
                self.load_block(ev, src);
            }
            // snoop request not addressed to us: ignore
            return;
        };

        if self.database[row].blocks[col].status == BlockStatus::Dirty {
            if src == Source::Snoop {
                // pretend we don't have it; somebody else will supply
                return;
            }
            fatal!(
                "{}: dirty block 0x{:x} answering a {} peer request",
                self.name,
                ev.base_addr,
                src
            );
        }

        if first {
            self.listener_notify(AccessKind::Read, AccessResult::Hit, ev.addr);
            self.stats.num_supply_hit += 1;
        }

        let base = self.database[row].blocks[col].base_addr;
        if let Some(sup) = self.supply_in_progress.get(&(base, src)) {
            if !sup.canceled {
                debug!("{}: already working on supplying 0x{:x}", self.name, base);
                return;
            }
        }
        if self.waiting_for_invalidate(base) {
            debug!("{}: invalidation for this in progress, queueing", self.name);
            self.invalidations
                .get_mut(&base)
                .unwrap()
                .waiting_events
                .push_back((ev, src));
            return;
        }

        debug!("{}: request hit for 0x{:x}, will supply data", self.name, base);
        if self.database[row].blocks[col].wb_in_progress {
            debug!("{}: a writeback is in progress, that will suffice", self.name);
            return;
        }
        self.supply_in_progress.insert((base, src), SupplyInfo::new());
        let now = self.tx.now();
        let b = &mut self.database[row].blocks[col];
        b.lock();
        b.last_touched = now;
        self.send_self(SelfAction::Supply(ev, (row, col), src), 1);
    }

    fn supply_data(&mut self, ev: MemEvent, (row, col): (usize, usize), src: Source) {
        let base = self.database[row].blocks[col].base_addr;
        let canceled = match self.supply_in_progress.get(&(base, src)) {
            Some(sup) => sup.canceled,
            None => fatal!("{}: supply of 0x{:x} with no record", self.name, base),
        };

        self.database[row].blocks[col].unlock();

        if canceled {
            debug!("{}: supply of 0x{:x} has been canceled", self.name, base);
            self.supply_in_progress.remove(&(base, src));
            return;
        }

        let mut resp = MemEvent::new(self.next_id(), &self.name, base, MemCmd::SupplyData);
        resp.base_addr = base;
        resp.size = self.params.blocksize;
        resp.dst = ev.src.clone();
        let fake;
        {
            let b = &mut self.database[row].blocks[col];
            if b.user_locked > 0 {
                // line is atomically locked; promise the data for later
                b.user_lock_needs_wb = true;
                resp.set_flag(MemFlags::DELAYED);
                fake = true;
            } else {
                if b.status == BlockStatus::Exclusive {
                    resp.set_flag(MemFlags::WRITEBACK);
                }
                resp.payload = b.data.clone();
                fake = false;
            }
        }

        match src {
            Source::Downstream => {
                self.send_downstream(resp);
                self.supply_in_progress.remove(&(base, src));
                if !fake {
                    self.database[row].blocks[col].status = BlockStatus::Shared;
                }
            }
            Source::Snoop => {
                debug!(
                    "{}: enqueuing request to supply{} block 0x{:x}",
                    self.name,
                    if fake { " delay" } else { "" },
                    base
                );
                self.supply_in_progress.get_mut(&(base, src)).unwrap().bus_event = Some(resp.id);
                self.snoop_bus.as_mut().unwrap().request(
                    resp,
                    Some(BusFinishAction::SupplySent {
                        addr: base,
                        row,
                        col,
                        src,
                        fake,
                    }),
                    Some(BusInitAction::SupplyPayload { row, col, fake }),
                );
            }
            Source::Directory => {
                if fake {
                    fatal!("{}: delayed supply toward the directory", self.name);
                }
                self.send_directory(resp);
                self.supply_in_progress.remove(&(base, src));
                self.database[row].blocks[col].status = BlockStatus::Shared;
            }
            Source::Upstream => {
                self.send_upstream(ev.link_id, resp);
                self.supply_in_progress.remove(&(base, src));
            }
            _ => {}
        }
    }

    // fills and writebacks (SupplyData)

    fn handle_cache_supply(&mut self, ev: MemEvent, src: Source) {
        if src == Source::Snoop && ev.src == self.name {
            return; // we sent it
        }

        // a snooped supply serves every observer at once: cancel our own
        // attempts to supply the same blocks
        if src == Source::Snoop && ev.size >= self.params.blocksize {
            let mut blk_addr = ev.base_addr;
            while blk_addr < ev.addr + ev.size as u64 {
                if let Some((r, c)) = self.find_block(blk_addr, false) {
                    if self.database[r].blocks[c].status == BlockStatus::Exclusive {
                        fatal!(
                            "{}: snooped a supply of 0x{:x} while holding it exclusive",
                            self.name,
                            blk_addr
                        );
                    }
                }
                if let Some(sup) = self.supply_in_progress.get_mut(&(blk_addr, Source::Snoop)) {
                    debug!("{}: marking supply for 0x{:x} as canceled", self.name, blk_addr);
                    sup.canceled = true;
                    if let Some(bus_ev) = sup.bus_event {
                        debug!("{}: canceling bus request for supply on 0x{:x}", self.name, blk_addr);
                        let handlers = self.snoop_bus.as_mut().unwrap().cancel_request(bus_ev);
                        if let Some(BusHandlers { finish: Some(_), .. }) = handlers {
                            self.supply_in_progress
                                .get_mut(&(blk_addr, Source::Snoop))
                                .unwrap()
                                .bus_event = None;
                        }
                    }
                }
                blk_addr += self.params.blocksize as u64;
            }
        }

        // are we trying to load this data?
        let load_addr = ev.base_addr;
        if self.waiting_loads.contains_key(&load_addr) {
            debug!("{}: we were waiting for block 0x{:x}, processing", self.name, load_addr);

            let bus_ev = self.waiting_loads.get_mut(&load_addr).unwrap().bus_event.take();
            if let (Some(id), Some(bus)) = (bus_ev, self.snoop_bus.as_mut()) {
                debug!("{}: canceling bus request for load on 0x{:x}", self.name, load_addr);
                bus.cancel_request(id);
            }

            let target = self.waiting_loads[&load_addr].target;
            let Some((row, col)) = target else {
                // no slot reserved yet, so we didn't ask for this; must be
                // a snoop we can ignore (no room in the inn)
                debug!("{}: no block available yet, ignoring", self.name);
                assert!(src == Source::Snoop);
                return;
            };

            if ev.query_flag(MemFlags::DELAYED) {
                // the line is locked elsewhere; the data comes later
                debug!("{}: got a DELAYED response, purging snoop work", self.name);
                let li = self.waiting_loads.get_mut(&load_addr).unwrap();
                if src == Source::Snoop {
                    for el in li.list.iter_mut() {
                        if el.src == Source::Snoop {
                            el.ev = None;
                        }
                    }
                }
                if li.list.iter().all(|el| el.ev.is_none()) {
                    // every reason to load this block is gone
                    self.waiting_loads.remove(&load_addr);
                    let b = &mut self.database[row].blocks[col];
                    b.load_info = None;
                    if b.is_assigned() {
                        b.status = BlockStatus::Invalid;
                    }
                    b.unlock();
                }
            } else {
                self.update_block(&ev, (row, col));
                let b = &mut self.database[row].blocks[col];
                b.load_info = None;
                b.status = BlockStatus::Shared;
                b.unlock();
                let li = self.waiting_loads.remove(&load_addr).unwrap();
                for el in li.list {
                    // other caches asking over the snoop bus saw the same
                    // transaction; no need to reprocess them
                    if src == Source::Snoop && el.src == Source::Snoop {
                        continue;
                    }
                    if let Some(e) = el.ev {
                        self.handle_incoming(e, el.src, false, true);
                    }
                }
            }
            self.handle_pending_events(row, Some((row, col)));
            return;
        }

        // no waiting load
        if self.params.mode == CacheMode::Inclusive {
            // not waiting for this load and we're inclusive: a writeback
            match self.find_block(ev.addr, false) {
                Some((row, col)) => {
                    let status = self.database[row].blocks[col].status;
                    if status != BlockStatus::Dirty && src != Source::Snoop {
                        fatal!("{}: unexpected inclusive supply for 0x{:x} in {:?}", self.name, ev.addr, status);
                    }
                    self.update_block(&ev, (row, col));
                    self.database[row].blocks[col].status = BlockStatus::Shared;
                }
                // inclusion means anything written back from above must hit
                None if src != Source::Snoop => {
                    fatal!("{}: inclusive writeback 0x{:x} for a block we don't hold", self.name, ev.addr)
                }
                None => {}
            }
        }

        match src {
            Source::Snoop => {
                debug!("{}: no matching waiting load for 0x{:x}", self.name, ev.addr);
                if ev.dst == self.name {
                    warn!(
                        "{}: unmatched supply for 0x{:x}; hopefully we just canceled this request",
                        self.name, ev.addr
                    );
                } else if ev.query_flag(MemFlags::WRITEBACK) && self.links.downstream.is_some() {
                    // on snoop with a downstream: pass the writeback on
                    self.send_downstream(ev);
                } else if ev.query_flag(MemFlags::WRITEBACK) && self.links.directory {
                    let mut fwd = ev;
                    fwd.src = self.name.clone();
                    fwd.dst = self.find_target_directory(fwd.base_addr);
                    self.send_directory(fwd);
                }
            }
            Source::Upstream => {
                if !ev.query_flag(MemFlags::WRITEBACK) {
                    fatal!("{}: unmatched non-writeback supply from upstream", self.name);
                }
                debug!("{}: passing on writeback to next level", self.name);
                if self.links.downstream.is_some() {
                    self.send_downstream(ev);
                } else if self.links.directory {
                    let mut fwd = ev;
                    fwd.src = self.name.clone();
                    fwd.dst = self.find_target_directory(fwd.base_addr);
                    self.send_directory(fwd);
                } else {
                    fatal!("{}: nowhere to forward a writeback", self.name);
                }
            }
            _ => {
                // unmatched supply from elsewhere; the peer will reissue
                warn!("{}: dropping unmatched supply for 0x{:x} from {}", self.name, ev.addr, src);
            }
        }
    }

    // loads

    fn init_load(&mut self, ev: &MemEvent) -> (Addr, bool) {
        let block_addr = ev.base_addr;
        if self.waiting_loads.contains_key(&block_addr) {
            (block_addr, false)
        } else {
            let mut li = LoadInfo::new(block_addr);
            li.initiating_event = ev.id;
            debug!("{}: no existing load for 0x{:x}, creating", self.name, block_addr);
            self.waiting_loads.insert(block_addr, li);
            (block_addr, true)
        }
    }

    fn load_block(&mut self, ev: MemEvent, src: Source) {
        let (block_addr, initial) = self.init_load(&ev);
        let reprocess = !initial;

        // a reprocess of anything but the head event just coalesces
        if reprocess && self.waiting_loads[&block_addr].initiating_event != ev.id {
            debug!("{}: adding to existing outstanding load for 0x{:x}", self.name, block_addr);
            let now = self.tx.now();
            self.waiting_loads
                .get_mut(&block_addr)
                .unwrap()
                .list
                .push_back(LoadElement {
                    ev: Some(ev),
                    src,
                    issue_time: now,
                });
            return;
        }

        let row = self.find_row(ev.addr);
        let Some(col) = self.database[row].get_lru() else {
            // row is full of locked blocks; wait for one to free up
            self.database[row].add_waiting_event(ev, src);
            return;
        };

        if self.params.mode == CacheMode::Inclusive
            && !self.database[row].blocks[col].is_invalid()
        {
            // upstream copies of the victim must go first; peers holding it
            // exclusive will write back before ack'ing
            debug!(
                "{}: replacing to handle load, invalidating upstream copies of 0x{:x}",
                self.name, self.database[row].blocks[col].base_addr
            );
            self.issue_invalidate_block(
                ev,
                src,
                (row, col),
                BlockStatus::Invalid,
                ForwardDir::Up,
                true,
            );
            return;
        }
        if self.database[row].blocks[col].status == BlockStatus::Exclusive {
            debug!(
                "{}: evicting block 0x{:x} to satisfy load for 0x{:x}",
                self.name, self.database[row].blocks[col].base_addr, ev.addr
            );
            self.database[row].add_waiting_event(ev, src);
            self.writeback_block((row, col), BlockStatus::Invalid); // we'll get it next time
            return;
        }
        debug!(
            "{}: replacing block 0x{:x} [{:?}]",
            self.name,
            self.database[row].blocks[col].base_addr,
            self.database[row].blocks[col].status
        );

        // simple load
        let tag = self.addr_to_tag(ev.addr);
        let b = &mut self.database[row].blocks[col];
        b.activate(block_addr, tag);
        b.lock();
        b.load_info = Some(block_addr);

        let now = self.tx.now();
        let li = self.waiting_loads.get_mut(&block_addr).unwrap();
        li.direction = ForwardDir::Down;
        li.target = Some((row, col));
        let element = LoadElement {
            ev: Some(ev),
            src,
            issue_time: now,
        };
        if reprocess {
            li.list.push_front(element);
        } else {
            li.list.push_back(element);
        }
        let load_id = li.initiating_event;
        self.send_self(SelfAction::FinishLoad(block_addr, load_id), 1);
    }

    fn finish_load_block(&mut self, addr: Addr, load_id: EventId) {
        debug!("{}: time to send load for 0x{:x}", self.name, addr);
        let Some(li) = self.waiting_loads.get(&addr) else {
            return; // load already satisfied
        };
        if li.initiating_event != load_id {
            return; // superseded by a fresh load of the same block
        }
        let Some((row, col)) = li.target else {
            return;
        };
        let direction = li.direction;

        // proceed only if the block is still reserved for this load, or is
        // dirty while we fetch upward
        let b = &self.database[row].blocks[col];
        let dirty_fetch_up = b.status == BlockStatus::Dirty && direction == ForwardDir::Up;
        if (!b.is_assigned() && !dirty_fetch_up)
            || b.base_addr != addr
            || b.load_info != Some(addr)
        {
            debug!(
                "{}: not going to bother loading, block 0x{:x} moved to {:?}",
                self.name, b.base_addr, b.status
            );
            return;
        }

        let mut req = MemEvent::new(self.next_id(), &self.name, addr, MemCmd::RequestData);
        req.base_addr = addr;
        req.size = self.params.blocksize;

        if direction == ForwardDir::Up {
            if !self.links.upstream.is_empty() && !self.is_l1 {
                for i in 0..self.links.upstream.len() {
                    self.send_upstream(i, req.clone());
                }
            } else if self.snoop_bus.is_some() {
                if let Some(next) = &self.params.next_level {
                    req.dst = next.clone();
                }
                debug!("{}: enqueuing bus request to fetch block 0x{:x}", self.name, addr);
                self.waiting_loads.get_mut(&addr).unwrap().bus_event = Some(req.id);
                self.snoop_bus.as_mut().unwrap().request(
                    req,
                    Some(BusFinishAction::LoadIssued { addr }),
                    None,
                );
            }
            return;
        }

        /* If you have both downstream and snoop you're probably at the end
         * of the line; just send the load down to memory. */
        if self.links.downstream.is_some() {
            debug!("{}: sending request to load block 0x{:x}", self.name, addr);
            self.send_downstream(req);
        } else if self.links.directory {
            debug!("{}: sending request to directory to load block 0x{:x}", self.name, addr);
            req.dst = self.find_target_directory(addr);
            self.send_directory(req);
        } else if self.snoop_bus.is_some() {
            if let Some(next) = &self.params.next_level {
                req.dst = next.clone();
            }
            debug!("{}: enqueuing bus request to load block 0x{:x}", self.name, addr);
            self.waiting_loads.get_mut(&addr).unwrap().bus_event = Some(req.id);
            self.snoop_bus.as_mut().unwrap().request(
                req,
                Some(BusFinishAction::LoadIssued { addr }),
                None,
            );
        }
    }

    // writebacks

    fn writeback_block(&mut self, (row, col): (usize, usize), new_status: BlockStatus) {
        if self.database[row].blocks[col].wb_in_progress {
            debug!(
                "{}: writeback already in progress for block 0x{:x}",
                self.name, self.database[row].blocks[col].base_addr
            );
            return;
        }
        self.database[row].blocks[col].wb_in_progress = true;

        if self.snoop_bus.is_some() {
            let b = &mut self.database[row].blocks[col];
            b.lock();
            let base = b.base_addr;
            debug!("{}: enqueuing request to writeback block 0x{:x}", self.name, base);
            let mut ev = MemEvent::new(self.next_id(), &self.name, base, MemCmd::SupplyData);
            ev.base_addr = base;
            ev.size = self.params.blocksize;
            ev.set_flag(MemFlags::WRITEBACK);
            ev.payload = self.database[row].blocks[col].data.clone();
            self.snoop_bus.as_mut().unwrap().request(
                ev,
                Some(BusFinishAction::WritebackDone {
                    row,
                    col,
                    new_status,
                }),
                Some(BusInitAction::WritebackPayload { row, col }),
            );
        } else {
            self.finish_writeback_block(row, col, new_status, false);
        }
    }

    fn finish_writeback_block(
        &mut self,
        row: usize,
        col: usize,
        new_status: BlockStatus,
        decrement_lock: bool,
    ) {
        self.database[row].blocks[col].wb_in_progress = false;
        if decrement_lock {
            // it went over the snoop bus
            self.database[row].blocks[col].unlock();
        }
        let base = self.database[row].blocks[col].base_addr;

        if self.links.downstream.is_some() {
            let mut ev = MemEvent::new(self.next_id(), &self.name, base, MemCmd::SupplyData);
            ev.base_addr = base;
            ev.size = self.params.blocksize;
            ev.set_flag(MemFlags::WRITEBACK);
            ev.payload = self.database[row].blocks[col].data.clone();
            self.send_downstream(ev);
        }
        if self.links.directory {
            let mut ev = MemEvent::new(self.next_id(), &self.name, base, MemCmd::SupplyData);
            ev.base_addr = base;
            ev.size = self.params.blocksize;
            ev.set_flag(MemFlags::WRITEBACK);
            ev.payload = self.database[row].blocks[col].data.clone();
            ev.dst = self.find_target_directory(base);
            self.send_directory(ev);
        }

        debug!(
            "{}: wrote back block 0x{:x}, new status {:?}",
            self.name, base, new_status
        );
        self.database[row].blocks[col].status = new_status;

        if new_status == BlockStatus::Invalid {
            if self.database[row].blocks[col].is_locked() {
                fatal!("{}: invalidated block 0x{:x} still locked", self.name, base);
            }
            self.handle_pending_events(row, None);
        } else {
            self.handle_pending_events(row, Some((row, col)));
        }
    }

    // directory fetches

    fn handle_fetch(&mut self, ev: MemEvent, invalidate: bool, has_invalidated: bool) {
        // fetches only come from directory controllers that know we have
        // the block
        if !self.links.directory {
            fatal!("{}: fetch without a directory link", self.name);
        }
        let Some((row, col)) = self.find_block(ev.addr, false) else {
            debug!(
                "{}: asked for 0x{:x} but we don't have it; punting",
                self.name, ev.addr
            );
            return;
        };
        let base = self.database[row].blocks[col].base_addr;
        debug!(
            "{}: fetch 0x{:x}, block status {:?}",
            self.name, base, self.database[row].blocks[col].status
        );

        if invalidate && !has_invalidated {
            debug!("{}: issuing invalidation for 0x{:x} upstream", self.name, base);
            self.issue_invalidate_block(
                ev,
                Source::Directory,
                (row, col),
                BlockStatus::Shared,
                ForwardDir::Up,
                true,
            );
            return;
        }

        match self.database[row].blocks[col].status {
            BlockStatus::Shared => {
                let mut resp = ev.make_response(self.next_id(), &self.name);
                resp.dst = ev.src.clone();
                resp.size = self.params.blocksize;
                resp.payload = self.database[row].blocks[col].data.clone();
                self.send_directory(resp);
            }
            BlockStatus::Dirty => {
                // fresh data lives upstream; can't invalidate yet
                self.fetch_block(ev, (row, col));
                return;
            }
            status => fatal!("{}: {:?} is not a legal status in a fetch", self.name, status),
        }

        if invalidate {
            self.database[row].blocks[col].status = BlockStatus::Invalid;
        }
    }

    /// fetch a dirty block from upstream
    fn fetch_block(&mut self, ev: MemEvent, (row, col): (usize, usize)) {
        let (block_addr, initial) = self.init_load(&ev);
        let reprocess = !initial;

        let b = &mut self.database[row].blocks[col];
        b.load_info = Some(block_addr);
        b.lock();

        let now = self.tx.now();
        let li = self.waiting_loads.get_mut(&block_addr).unwrap();
        li.target = Some((row, col));
        li.direction = ForwardDir::Up;
        let element = LoadElement {
            ev: Some(ev),
            src: Source::Directory,
            issue_time: now,
        };
        if reprocess {
            li.list.push_front(element);
        } else {
            li.list.push_back(element);
        }
        let load_id = li.initiating_event;
        self.send_self(SelfAction::FinishLoad(block_addr, load_id), 1);
    }

    // NACKs

    fn handle_nack(&mut self, ev: MemEvent, _src: Source) {
        // check the queues to see what was NACK'd: invalidations first,
        // then waiting loads
        let addr = ev.base_addr;
        if let Some(inv) = self.invalidations.get(&addr) {
            debug!("{}: NACK for invalidation of 0x{:x}", self.name, ev.addr);
            if ev.response_to == inv.issuing_event {
                if !inv.can_cancel {
                    fatal!("{}: NACK for an uncancelable invalidation of 0x{:x}", self.name, addr);
                }
                let inv = self.invalidations.remove(&addr).unwrap();
                for (old_ev, old_src) in inv.waiting_events {
                    if self.is_l1 {
                        // can't propagate the NACK any higher, just re-issue
                        if let Some((row, col)) = self.find_block(ev.addr, false) {
                            if self.database[row].blocks[col].is_locked() {
                                self.database[row].blocks[col].unlock();
                            }
                        }
                        debug!(
                            "{}: rescheduling event ({}, {}) {:?} 0x{:x}",
                            self.name, old_ev.id.0, old_ev.id.1, old_ev.cmd, old_ev.addr
                        );
                        self.send_self(SelfAction::Retry(old_ev, old_src), 1);
                    } else {
                        let mut nack = old_ev.make_response(self.next_id(), &self.name);
                        nack.cmd = MemCmd::NACK;
                        nack.size = 0;
                        match old_src {
                            Source::Snoop => {
                                self.snoop_bus.as_mut().unwrap().request(nack, None, None)
                            }
                            Source::Upstream => self.send_upstream(old_ev.link_id, nack),
                            Source::Downstream => self.send_downstream(nack),
                            Source::Directory => self.send_directory(nack),
                            Source::SelfLink | Source::Prefetcher => {
                                fatal!("{}: NACK'ing an event we sent ourselves", self.name)
                            }
                        }
                    }
                }
                return;
            }
            debug!(
                "{}: NACK for 0x{:x} does not match the request id, passing",
                self.name, ev.addr
            );
        }

        if let Some(li) = self.waiting_loads.get(&addr) {
            debug!("{}: NACK for RequestData of 0x{:x}", self.name, ev.addr);
            let load_id = li.initiating_event;
            self.send_self(SelfAction::FinishLoad(addr, load_id), 1);
            return;
        }

        warn!("{}: unexpected NACK for 0x{:x}, ignoring", self.name, ev.addr);
    }

    // utilities

    /// retry events parked on a row, either those for one settled block or
    /// any one queue once a slot has freed up
    fn handle_pending_events(&mut self, row: usize, block: Option<(usize, usize)>) {
        if self.database[row].waiting_events.is_empty() {
            return;
        }
        let key = match block {
            Some((r, c)) => {
                let base = self.database[r].blocks[c].base_addr;
                if self.database[row].waiting_events.contains_key(&base) {
                    Some(base)
                } else {
                    None
                }
            }
            None => self.database[row].waiting_events.keys().next().copied(),
        };
        let Some(key) = key else {
            return;
        };
        if let Some(queue) = self.database[row].waiting_events.remove(&key) {
            for (ev, src) in queue {
                debug!(
                    "{}: issuing retry for event ({}, {}) {:?} [0x{:x}]",
                    self.name, ev.id.0, ev.id.1, ev.cmd, ev.addr
                );
                self.send_self(SelfAction::Retry(ev, src), 1);
            }
        }
    }

    fn update_block(&mut self, ev: &MemEvent, (row, col): (usize, usize)) {
        let blocksize = self.params.blocksize;
        let now = self.tx.now();
        let b = &mut self.database[row].blocks[col];
        if ev.size == blocksize {
            // equal sizes implies equal base addresses
            b.data.copy_from_slice(&ev.payload);
        } else {
            // update a portion of the block
            let blockoffset = ev.addr.saturating_sub(b.base_addr) as usize;
            let payloadoffset = b.base_addr.saturating_sub(ev.addr) as usize;
            for i in 0..blocksize.min(ev.size) as usize {
                assert!(blockoffset + i < blocksize as usize);
                b.data[blockoffset + i] = ev.payload[payloadoffset + i];
            }
        }
        debug!("{}: updating block 0x{:x}", self.name, b.base_addr);
        b.last_touched = now;
    }

    fn find_target_directory(&self, addr: Addr) -> String {
        for d in &self.directories {
            if addr >= d.range_start && addr < d.range_end {
                if d.interleave_size == 0 {
                    return d.name.clone();
                }
                let offset = (addr - d.range_start) % d.interleave_step;
                if offset < d.interleave_size {
                    return d.name.clone();
                }
            }
        }
        fatal!("{}: unable to find directory for address 0x{:x}", self.name, addr);
    }

    /// per-cache counters, reported at teardown
    pub fn finish(&self) {
        println!(
            "Cache {} stats:\n\
             \t# Read    Hits:      {}\n\
             \t# Read    Misses:    {}\n\
             \t# Supply  Hits:      {}\n\
             \t# Supply  Misses:    {}\n\
             \t# Write   Hits:      {}\n\
             \t# Write   Misses:    {}\n\
             \t# Upgrade Misses:    {}",
            self.name,
            self.stats.num_read_hit,
            self.stats.num_read_miss,
            self.stats.num_supply_hit,
            self.stats.num_supply_miss,
            self.stats.num_write_hit,
            self.stats.num_write_miss,
            self.stats.num_upgrade_miss
        );
    }

    /// debug dump of rows, waiting loads and pending row events
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = writeln!(s, "{}", self.name);
        for (r, row) in self.database.iter().enumerate() {
            let _ = write!(s, "{:2} | ", r);
            for b in &row.blocks {
                let _ = write!(s, "{} 0x{:08x} {:4} | ", b.status.short(), b.base_addr, b.tag);
            }
            let _ = writeln!(s);
        }
        if !self.waiting_loads.is_empty() {
            let _ = writeln!(s, "Waiting Loads");
            for (addr, li) in &self.waiting_loads {
                let _ = write!(s, "0x{:04x}", addr);
                if let Some((r, c)) = li.target {
                    let _ = write!(s, " slated for [{}, {}]", r, c);
                }
                let _ = writeln!(s);
                for el in &li.list {
                    if let Some(ev) = &el.ev {
                        let elapsed = self.tx.now() - el.issue_time;
                        let _ =
                            writeln!(s, "\t({}, {}) {:?}\t{}", ev.id.0, ev.id.1, ev.cmd, elapsed);
                    }
                }
            }
        }
        let num_pend: usize = self.database.iter().map(|r| r.waiting_events.len()).sum();
        if num_pend > 0 {
            let _ = writeln!(s, "Pending Events\t{}", num_pend);
        }
        if let Some(bus) = &self.snoop_bus {
            if !bus.is_empty() {
                let _ = writeln!(s, "Bus Queue Size:  {}", bus.len());
            }
        }
        s
    }
}

impl MsgHandler<CacheMsg> for Cache {
    fn handle_msg(&mut self, msg: CacheMsg) {
        match msg {
            CacheMsg::Link(ev, src) => self.handle_incoming(ev, src, true, false),
            CacheMsg::SelfEvent(action) => self.handle_self_event(action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delayed_q::DelayedQ;

    fn test_cache(params: CacheParams) -> Cache {
        let (_dq, tx) = DelayedQ::<Msg>::new();
        Cache::new(
            0,
            1,
            "l1",
            params,
            CacheLinks::default(),
            Box::new(NullListener),
            tx,
        )
        .unwrap()
    }

    #[test]
    fn test_address_split() {
        let cache = test_cache(CacheParams {
            num_ways: 2,
            num_rows: 2,
            blocksize: 64,
            ..Default::default()
        });
        assert_eq!(cache.addr_to_block_addr(0x1a7), 0x180);
        assert_eq!(cache.find_row(0x100), 0); // bit 6 clear
        assert_eq!(cache.find_row(0x140), 1);
        assert_eq!(cache.addr_to_tag(0x180), 3);
    }

    #[test]
    fn test_find_block_empty_ok() {
        let mut cache = test_cache(CacheParams {
            num_ways: 2,
            num_rows: 2,
            blocksize: 64,
            ..Default::default()
        });
        assert_eq!(cache.find_block(0x100, false), None);
        let (row, col) = cache.find_block(0x100, true).unwrap();
        assert_eq!(row, 0);
        let tag = cache.addr_to_tag(0x100);
        cache.database[row].blocks[col].activate(0x100, tag);
        // assigned blocks are not hits
        assert_eq!(cache.find_block(0x100, false), None);
        cache.database[row].blocks[col].status = BlockStatus::Shared;
        assert_eq!(cache.find_block(0x100, false), Some((row, col)));
    }

    #[test]
    fn test_directory_targeting() {
        let mut cache = test_cache(CacheParams::default());
        cache.set_directory_peers(vec![
            DirEntry {
                range_start: 0,
                range_end: 0x1000,
                interleave_size: 0x40,
                interleave_step: 0x80,
                name: "dir0".to_string(),
            },
            DirEntry {
                range_start: 0,
                range_end: 0x1000,
                interleave_size: 0,
                interleave_step: 0,
                name: "dir1".to_string(),
            },
        ]);
        // interleaved entry matches only the first 0x40 of every 0x80
        assert_eq!(cache.find_target_directory(0x20), "dir0");
        assert_eq!(cache.find_target_directory(0x60), "dir1");
        assert_eq!(cache.find_target_directory(0xa0), "dir0");
    }

    #[test]
    #[should_panic]
    fn test_directory_lookup_failure_is_fatal() {
        let cache = test_cache(CacheParams::default());
        cache.find_target_directory(0x2000);
    }

    #[test]
    fn test_exclusive_mode_rejected() {
        let (_dq, tx) = DelayedQ::<Msg>::new();
        let err = Cache::new(
            0,
            1,
            "l2",
            CacheParams {
                mode: CacheMode::Exclusive,
                ..Default::default()
            },
            CacheLinks::default(),
            Box::new(NullListener),
            tx,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::ExclusiveUnimplemented));
    }
}
