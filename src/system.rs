// system assembly and event loop: components exchange messages through
// the delayed queue; the loop pops them in time order and routes them

use log::warn;

use crate::bus::{Bus, BusPort};
use crate::cache::{load_listener, Cache, CacheLinks};
use crate::commons::{CacheParams, ConfigError, Instructions, MemEvent, Msg, MsgHandler, Wire};
use crate::delayed_q::{DelQSender, DelayedMsg, DelayedQ};
use crate::memory::Memory;
use crate::processor::{ProcMsg, Processor};

pub struct System {
    dq: DelayedQ<Msg>,
    pub tx: DelQSender<Msg>,
    pub caches: Vec<Cache>,
    pub procs: Vec<Processor>,
    pub bus: Option<Bus>,
    pub mem: Option<Memory>,
    /// events sent on directory links, tagged with the sending cache
    pub dir_outbox: Vec<(usize, MemEvent)>,
    /// responses delivered to upstream slots with no processor attached
    pub cpu_outbox: Vec<(usize, MemEvent)>,
    /// copies of every bus broadcast, when a probe is attached
    pub bus_trace: Vec<MemEvent>,
    next_comp: u32,
}

impl System {
    pub fn new() -> Self {
        let (dq, tx) = DelayedQ::new();
        System {
            dq,
            tx,
            caches: Vec::new(),
            procs: Vec::new(),
            bus: None,
            mem: None,
            dir_outbox: Vec::new(),
            cpu_outbox: Vec::new(),
            bus_trace: Vec::new(),
            next_comp: 0,
        }
    }

    fn alloc_comp(&mut self) -> u32 {
        let c = self.next_comp;
        self.next_comp += 1;
        c
    }

    // assembly

    pub fn add_bus(&mut self, transfer_time: u64) {
        let comp = self.alloc_comp();
        self.bus = Some(Bus::new(comp, self.tx.clone(), transfer_time));
    }
    pub fn add_bus_probe(&mut self) {
        self.bus.as_mut().unwrap().attach(BusPort::Probe);
    }
    pub fn add_memory(&mut self, name: &str, blocksize: u32, mem_lat: u64) {
        let comp = self.alloc_comp();
        self.mem = Some(Memory::new(comp, name, blocksize, mem_lat, self.tx.clone()));
    }
    pub fn add_cache(
        &mut self,
        name: &str,
        params: CacheParams,
        links: CacheLinks,
    ) -> Result<usize, ConfigError> {
        let idx = self.caches.len();
        let comp = self.alloc_comp();
        let listener = load_listener("")?;
        self.caches.push(Cache::new(
            idx,
            comp,
            name,
            params,
            links,
            listener,
            self.tx.clone(),
        )?);
        Ok(idx)
    }
    pub fn cache_to_bus(&mut self, idx: usize) {
        let port = self.bus.as_mut().unwrap().attach(BusPort::Cache(idx));
        self.caches[idx].connect_snoop(port);
    }
    pub fn mem_to_bus(&mut self) {
        let port = self.bus.as_mut().unwrap().attach(BusPort::Mem);
        self.mem.as_mut().unwrap().connect_snoop(port);
    }
    pub fn add_proc(&mut self, insts: Instructions, cache_idx: usize) -> usize {
        let id = self.procs.len();
        let comp = self.alloc_comp();
        let name = format!("cpu{}", id);
        self.procs.push(Processor::new(
            id,
            comp,
            &name,
            insts,
            Wire::CacheUpstream {
                id: cache_idx,
                link: 0,
            },
            self.tx.clone(),
        ));
        id
    }

    /// the reference topology: N CPU+cache pairs on a snoop bus with a
    /// bus-attached memory as the next level
    pub fn smp(
        n: usize,
        params: &CacheParams,
        mem_lat: u64,
        insts: Vec<Instructions>,
    ) -> Result<System, ConfigError> {
        assert_eq!(insts.len(), n);
        let mut sys = System::new();
        sys.add_bus(1);
        sys.add_memory("memory", params.blocksize, mem_lat);
        for (i, insts) in insts.into_iter().enumerate() {
            let mut p = params.clone();
            p.num_upstream = 1;
            p.set_next_level("memory");
            let links = CacheLinks {
                upstream: vec![Wire::Proc(i)],
                downstream: None,
                directory: false,
            };
            let idx = sys.add_cache(&format!("cache{}", i), p, links)?;
            sys.cache_to_bus(idx);
            sys.add_proc(insts, idx);
        }
        sys.mem_to_bus();
        Ok(sys)
    }

    // running

    pub fn start_procs(&self) {
        for p in &self.procs {
            self.tx.send(DelayedMsg {
                t: 0,
                msg: Msg::ToProc(p.id, ProcMsg::Start),
            });
        }
    }

    pub fn inject(&self, msg: Msg) {
        self.tx.send(DelayedMsg { t: 0, msg });
    }

    /// drain the event queue; returns false if the budget ran out first
    pub fn run(&mut self, max_events: usize) -> bool {
        let mut n = 0usize;
        loop {
            while let Some(msg) = self.dq.try_fetch() {
                self.route(msg);
                n += 1;
                if n >= max_events {
                    warn!("system: event budget exhausted after {} events", n);
                    return false;
                }
            }
            match self.dq.next_time() {
                Some(t) => self.dq.update_time(t),
                None => return true,
            }
        }
    }

    /// drain only the messages due up to `t_stop`, leaving later ones queued
    pub fn run_until(&mut self, t_stop: u64) {
        loop {
            while let Some(msg) = self.dq.try_fetch() {
                self.route(msg);
            }
            match self.dq.next_time() {
                Some(t) if t <= t_stop => self.dq.update_time(t),
                _ => return,
            }
        }
    }

    pub fn time(&self) -> u64 {
        self.tx.now()
    }

    fn route(&mut self, msg: Msg) {
        match msg {
            Msg::ToCache(i, m) => self.caches[i].handle_msg(m),
            Msg::ToProc(i, m) => {
                if i < self.procs.len() {
                    self.procs[i].handle_msg(m);
                } else if let ProcMsg::Resp(ev) = m {
                    self.cpu_outbox.push((i, ev));
                }
            }
            Msg::ToBus(m) => match self.bus.as_mut() {
                Some(bus) => bus.handle_msg(m),
                None => warn!("system: bus message with no bus"),
            },
            Msg::ToMem(m) => match self.mem.as_mut() {
                Some(mem) => mem.handle_msg(m),
                None => warn!("system: memory message with no memory"),
            },
            Msg::ToDirectory(i, ev) => self.dir_outbox.push((i, ev)),
            Msg::ToProbe(ev) => self.bus_trace.push(ev),
        }
    }

    // teardown

    pub fn finish(&self) {
        for cache in &self.caches {
            cache.finish();
        }
    }
}

impl Default for System {
    fn default() -> Self {
        System::new()
    }
}
