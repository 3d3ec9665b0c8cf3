// backing memory model: serves block fetches after a fixed latency,
// absorbs writebacks, acknowledges invalidates

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::bus::SnoopBusQueue;
use crate::commons::{Addr, EventId, MemCmd, MemEvent, MemFlags, Msg, MsgHandler, Wire};
use crate::delayed_q::{DelQSender, DelayedMsg};

type DelQMsgSender = DelQSender<Msg>;

pub enum MemMsg {
    /// arrival on a link; true when it came over the snoop bus
    Link(MemEvent, bool),
    /// response ready to go on the wire after the access latency
    SelfSend(MemEvent),
}

pub struct Memory {
    name: String,
    comp: u32,
    tx: DelQMsgSender,
    mem_lat: u64,
    blocksize: u32,
    store: HashMap<Addr, Vec<u8>>,
    /// reply routes for point-to-point requesters, by component name
    ports: HashMap<String, Wire>,
    bus: Option<SnoopBusQueue<(), ()>>,
    /// blocks with a fetch in flight; a bus supply serves every observer,
    /// so duplicate snooped requests coalesce
    pending: HashSet<Addr>,
    /// pending responses overtaken by another supplier on the bus
    squashed: HashSet<Addr>,

    pub num_supplies: u64,
    pub num_writebacks: u64,
}

impl Memory {
    pub fn new(comp: u32, name: &str, blocksize: u32, mem_lat: u64, tx: DelQMsgSender) -> Self {
        Memory {
            name: name.to_string(),
            comp,
            tx,
            mem_lat,
            blocksize,
            store: HashMap::new(),
            ports: HashMap::new(),
            bus: None,
            pending: HashSet::new(),
            squashed: HashSet::new(),
            num_supplies: 0,
            num_writebacks: 0,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn add_port(&mut self, peer: &str, wire: Wire) {
        self.ports.insert(peer.to_string(), wire);
    }
    pub fn connect_snoop(&mut self, port: usize) {
        self.bus = Some(SnoopBusQueue::new(port, self.tx.clone()));
    }
    /// test hook: seed backing storage
    pub fn poke(&mut self, addr: Addr, data: Vec<u8>) {
        assert_eq!(data.len(), self.blocksize as usize);
        self.store.insert(self.block_addr(addr), data);
    }
    pub fn peek(&self, addr: Addr) -> Option<&[u8]> {
        self.store.get(&self.block_addr(addr)).map(|d| d.as_slice())
    }

    fn block_addr(&self, addr: Addr) -> Addr {
        addr & !((self.blocksize - 1) as Addr)
    }
    fn next_id(&self) -> EventId {
        (self.tx.alloc_seq(), self.comp)
    }
    fn defer(&self, ev: MemEvent, delay: u64) {
        self.tx.send(DelayedMsg {
            t: delay,
            msg: Msg::ToMem(MemMsg::SelfSend(ev)),
        });
    }
    /// route a ready response: point-to-point when we know the peer,
    /// otherwise over the bus
    fn dispatch(&mut self, ev: MemEvent) {
        if ev.cmd == MemCmd::SupplyData {
            self.pending.remove(&ev.base_addr);
            if self.squashed.remove(&ev.base_addr) {
                debug!("{}: dropping squashed supply of 0x{:x}", self.name, ev.base_addr);
                return;
            }
        }
        if let Some(wire) = self.ports.get(&ev.dst) {
            self.tx.send(DelayedMsg {
                t: 1,
                msg: wire.deliver(ev),
            });
        } else if let Some(bus) = self.bus.as_mut() {
            bus.request(ev, None, None);
        } else {
            warn!("{}: no route to {}, dropping response", self.name, ev.dst);
        }
    }

    fn handle_event(&mut self, ev: MemEvent, via_snoop: bool) {
        match ev.cmd {
            MemCmd::BusClearToSend => {
                let pending = match self.bus.as_mut() {
                    Some(bus) => bus.clear_to_send(),
                    None => return,
                };
                if let Some(pending) = pending {
                    self.bus.as_ref().unwrap().send(pending.ev);
                }
            }
            MemCmd::RequestData => {
                if via_snoop && ev.dst != self.name {
                    return; // somebody else's transaction
                }
                if ev.src == self.name {
                    return;
                }
                let base = self.block_addr(ev.addr);
                if via_snoop && self.pending.contains(&base) {
                    debug!("{}: already fetching 0x{:x}", self.name, base);
                    return;
                }
                if via_snoop {
                    self.pending.insert(base);
                }
                let mut resp = MemEvent::new(self.next_id(), &self.name, base, MemCmd::SupplyData);
                resp.response_to = ev.id;
                resp.dst = ev.src.clone();
                resp.size = self.blocksize;
                resp.payload = self
                    .store
                    .get(&base)
                    .cloned()
                    .unwrap_or_else(|| vec![0; self.blocksize as usize]);
                debug!("{}: serving block 0x{:x} for {}", self.name, base, ev.src);
                self.num_supplies += 1;
                self.defer(resp, self.mem_lat);
            }
            MemCmd::SupplyData => {
                let base = self.block_addr(ev.addr);
                if via_snoop && ev.src != self.name && self.pending.remove(&base) {
                    // another supplier beat us to the line
                    debug!("{}: supply for 0x{:x} observed on the bus, squashing ours", self.name, base);
                    self.squashed.insert(base);
                }
                if ev.query_flag(MemFlags::WRITEBACK) && ev.src != self.name {
                    debug!("{}: absorbing writeback of 0x{:x}", self.name, base);
                    self.store.insert(base, ev.payload);
                    self.num_writebacks += 1;
                }
            }
            MemCmd::Invalidate => {
                // memory holds no cached state; just acknowledge, except on
                // the bus where the total order stands in for the ACK
                if !via_snoop {
                    let resp = ev.make_response(self.next_id(), &self.name);
                    self.defer(resp, 1);
                }
            }
            _ => {}
        }
    }
}

impl MsgHandler<MemMsg> for Memory {
    fn handle_msg(&mut self, msg: MemMsg) {
        match msg {
            MemMsg::Link(ev, via_snoop) => self.handle_event(ev, via_snoop),
            MemMsg::SelfSend(ev) => self.dispatch(ev),
        }
    }
}
