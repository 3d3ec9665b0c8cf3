// end-to-end coherence scenarios on small systems: a single cache over a
// point-to-point memory, and two caches sharing a snoopy bus

use cachesim_mh::cache::storage::BlockStatus;
use cachesim_mh::cache::tables::DirEntry;
use cachesim_mh::cache::{CacheLinks, CacheMsg};
use cachesim_mh::commons::{
    Addr, CacheMode, CacheParams, EventId, MemCmd, MemEvent, MemFlags, Msg, Source, Wire,
};
use cachesim_mh::system::System;

const BLOCKSIZE: u32 = 64;
const MEM_LAT: u64 = 20;

fn params() -> CacheParams {
    CacheParams {
        num_ways: 2,
        num_rows: 2,
        blocksize: BLOCKSIZE,
        access_time: 1,
        num_upstream: 1,
        ..Default::default()
    }
}

/// one cache, CPU stub upstream, point-to-point memory downstream
fn single_cache_system(p: CacheParams) -> System {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, MEM_LAT);
    let mut p = p;
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0)],
        downstream: Some(Wire::Mem),
        directory: false,
    };
    let idx = sys.add_cache("l1", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l1", Wire::CacheDownstream { id: idx });
    sys
}

/// n caches and a memory sharing a snoop bus, CPU stubs upstream
fn bus_system(n: usize, mem_lat: u64) -> System {
    let mut sys = System::new();
    sys.add_bus(1);
    sys.add_memory("memory", BLOCKSIZE, mem_lat);
    for i in 0..n {
        let mut p = params();
        p.set_next_level("memory");
        let links = CacheLinks {
            upstream: vec![Wire::Proc(i)],
            downstream: None,
            directory: false,
        };
        let idx = sys.add_cache(&format!("cache{}", i), p, links).unwrap();
        sys.cache_to_bus(idx);
    }
    sys.mem_to_bus();
    sys.add_bus_probe();
    sys
}

fn new_id(sys: &System) -> EventId {
    (sys.tx.alloc_seq(), 99)
}

fn cpu_request(
    sys: &System,
    cache: usize,
    src: &str,
    addr: Addr,
    cmd: MemCmd,
    payload: Vec<u8>,
    locked: bool,
) -> EventId {
    let mut ev = MemEvent::new(new_id(sys), src, addr, cmd);
    ev.size = if payload.is_empty() { 4 } else { payload.len() as u32 };
    ev.payload = payload;
    if locked {
        ev.set_flag(MemFlags::LOCKED);
    }
    let id = ev.id;
    sys.inject(Msg::ToCache(cache, CacheMsg::Link(ev, Source::Upstream)));
    id
}

fn cpu_read(sys: &System, cache: usize, src: &str, addr: Addr) -> EventId {
    cpu_request(sys, cache, src, addr, MemCmd::ReadReq, Vec::new(), false)
}
fn cpu_read_locked(sys: &System, cache: usize, src: &str, addr: Addr) -> EventId {
    cpu_request(sys, cache, src, addr, MemCmd::ReadReq, Vec::new(), true)
}
fn cpu_write(sys: &System, cache: usize, src: &str, addr: Addr, data: Vec<u8>) -> EventId {
    cpu_request(sys, cache, src, addr, MemCmd::WriteReq, data, false)
}
fn cpu_write_locked(sys: &System, cache: usize, src: &str, addr: Addr, data: Vec<u8>) -> EventId {
    cpu_request(sys, cache, src, addr, MemCmd::WriteReq, data, true)
}

fn response(sys: &System, id: EventId) -> Option<&MemEvent> {
    sys.cpu_outbox
        .iter()
        .map(|(_, ev)| ev)
        .find(|ev| ev.response_to == id)
}

fn run(sys: &mut System) {
    assert!(sys.run(100_000), "event budget exhausted");
}

#[test]
fn test_read_miss_fills_from_memory() {
    let mut sys = single_cache_system(params());
    sys.mem.as_mut().unwrap().poke(0x100, vec![0xaa; 64]);

    let id = cpu_read(&sys, 0, "cpu0", 0x100);
    run(&mut sys);

    let resp = response(&sys, id).expect("no CPU response");
    assert_eq!(resp.cmd, MemCmd::SupplyData);
    assert_eq!(resp.payload, vec![0xaa; 4]);
    assert_eq!(sys.caches[0].block_status(0x100), Some(BlockStatus::Shared));
    assert_eq!(sys.mem.as_ref().unwrap().num_supplies, 1);
    assert_eq!(sys.caches[0].stats().num_read_miss, 1);
    assert!(sys.caches[0].quiescent());
}

#[test]
fn test_write_upgrade_makes_block_exclusive() {
    let mut sys = single_cache_system(params());

    let rd = cpu_read(&sys, 0, "cpu0", 0x100);
    run(&mut sys);
    assert!(response(&sys, rd).is_some());
    assert_eq!(sys.caches[0].block_status(0x100), Some(BlockStatus::Shared));

    let wr = cpu_write(&sys, 0, "cpu0", 0x100, vec![1, 2, 3, 4]);
    run(&mut sys);
    assert!(response(&sys, wr).is_some());
    assert_eq!(
        sys.caches[0].block_status(0x100),
        Some(BlockStatus::Exclusive)
    );
    assert_eq!(sys.caches[0].stats().num_upgrade_miss, 1);

    // no lost writes: the written bytes come back on a later read
    let rd2 = cpu_read(&sys, 0, "cpu0", 0x100);
    run(&mut sys);
    assert_eq!(response(&sys, rd2).unwrap().payload, vec![1, 2, 3, 4]);
}

#[test]
fn test_bus_read_sharing_single_memory_load() {
    let mut sys = bus_system(2, MEM_LAT);
    sys.mem.as_mut().unwrap().poke(0x200, vec![0x42; 64]);

    let id0 = cpu_read(&sys, 0, "cpu0", 0x200);
    let id1 = cpu_read(&sys, 1, "cpu1", 0x200);
    run(&mut sys);

    assert_eq!(response(&sys, id0).unwrap().payload, vec![0x42; 4]);
    assert_eq!(response(&sys, id1).unwrap().payload, vec![0x42; 4]);
    // the single supply broadcast served both requesters
    assert_eq!(sys.mem.as_ref().unwrap().num_supplies, 1);
    assert_eq!(sys.caches[0].block_status(0x200), Some(BlockStatus::Shared));
    assert_eq!(sys.caches[1].block_status(0x200), Some(BlockStatus::Shared));
}

#[test]
fn test_atomic_lock_delays_peer_supply() {
    let mut sys = bus_system(2, 200);
    sys.mem.as_mut().unwrap().poke(0x300, vec![0; 64]);

    // first CPU takes the line with an atomic lock
    let id0 = cpu_read_locked(&sys, 0, "cpu0", 0x300);
    run(&mut sys);
    assert!(response(&sys, id0).is_some());
    assert_eq!(
        sys.caches[0].block_status(0x300),
        Some(BlockStatus::Exclusive)
    );

    // second CPU tries the same line while the lock is held; the owner
    // answers with a payload-less delayed supply
    let id1 = cpu_read_locked(&sys, 1, "cpu1", 0x300);
    let t = sys.time();
    sys.run_until(t + 40);
    assert!(response(&sys, id1).is_none(), "lock window was not honored");
    assert!(
        sys.bus_trace
            .iter()
            .any(|ev| ev.cmd == MemCmd::SupplyData && ev.query_flag(MemFlags::DELAYED)),
        "no delayed supply observed on the bus"
    );

    // the unlocking write triggers the writeback that satisfies the peer
    let unlock = cpu_write_locked(&sys, 0, "cpu0", 0x300, vec![0xde, 0xad, 0xbe, 0xef]);
    run(&mut sys);
    assert!(response(&sys, unlock).is_some());
    let resp1 = response(&sys, id1).expect("second atomic read never completed");
    assert_eq!(resp1.payload, vec![0xde, 0xad, 0xbe, 0xef]);

    // the second cache owns the line now
    assert_eq!(
        sys.caches[1].block_status(0x300),
        Some(BlockStatus::Exclusive)
    );
    assert_ne!(
        sys.caches[0].block_status(0x300),
        Some(BlockStatus::Exclusive)
    );
}

#[test]
fn test_fetch_invalidate_from_directory() {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, MEM_LAT);
    let mut p = params();
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0)],
        downstream: Some(Wire::Mem),
        directory: true,
    };
    let idx = sys.add_cache("l1", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l1", Wire::CacheDownstream { id: idx });
    sys.caches[0].set_directory_peers(vec![DirEntry {
        range_start: 0,
        range_end: 0x10000,
        interleave_size: 0,
        interleave_step: 0,
        name: "dir0".to_string(),
    }]);

    // fill, then dirty the block through a write upgrade
    let rd = cpu_read(&sys, 0, "cpu0", 0x400);
    run(&mut sys);
    assert!(response(&sys, rd).is_some());
    let wr = cpu_write(&sys, 0, "cpu0", 0x400, vec![0x5a; 4]);
    run(&mut sys);
    // the upgrade invalidate also went to the directory; answer for it
    let inv = sys
        .dir_outbox
        .iter()
        .map(|(_, ev)| ev.clone())
        .find(|ev| ev.cmd == MemCmd::Invalidate)
        .expect("no invalidate reached the directory");
    let ack = inv.make_response((90_000, 50), "dir0");
    sys.inject(Msg::ToCache(0, CacheMsg::Link(ack, Source::Directory)));
    run(&mut sys);
    assert!(response(&sys, wr).is_some());
    assert_eq!(
        sys.caches[0].block_status(0x400),
        Some(BlockStatus::Exclusive)
    );

    // the directory wants the line back
    let fetch = MemEvent::new((90_001, 50), "dir0", 0x400, MemCmd::FetchInvalidate);
    sys.inject(Msg::ToCache(0, CacheMsg::Link(fetch, Source::Directory)));
    run(&mut sys);

    // an invalidate went up to the CPU; acknowledge it
    let up_inv = sys
        .cpu_outbox
        .iter()
        .map(|(_, ev)| ev.clone())
        .find(|ev| ev.cmd == MemCmd::Invalidate)
        .expect("no upstream invalidate");
    let ack = up_inv.make_response((90_002, 50), "cpu0");
    sys.inject(Msg::ToCache(0, CacheMsg::Link(ack, Source::Upstream)));
    run(&mut sys);

    // the modified payload went to the directory and the block is gone
    let supply = sys
        .dir_outbox
        .iter()
        .map(|(_, ev)| ev)
        .find(|ev| ev.cmd == MemCmd::SupplyData)
        .expect("no payload reached the directory");
    assert_eq!(&supply.payload[0..4], &[0x5a; 4]);
    assert_eq!(sys.caches[0].block_status(0x400), None);
    assert!(sys.caches[0].quiescent());
}

#[test]
fn test_lru_eviction_under_capacity_pressure() {
    let mut sys = single_cache_system(params());

    // four distinct blocks hashing to row 0, twice the ways available
    let addrs: [Addr; 4] = [0x000, 0x080, 0x100, 0x180];
    let mut ids = Vec::new();
    for &addr in &addrs {
        ids.push(cpu_read(&sys, 0, "cpu0", addr));
        run(&mut sys);
    }
    for id in &ids {
        assert!(response(&sys, *id).is_some());
    }
    // the last two survive, the first two were evicted in LRU order
    assert_eq!(sys.caches[0].block_status(0x000), None);
    assert_eq!(sys.caches[0].block_status(0x080), None);
    assert_eq!(sys.caches[0].block_status(0x100), Some(BlockStatus::Shared));
    assert_eq!(sys.caches[0].block_status(0x180), Some(BlockStatus::Shared));

    // burst of misses to the same row: two get slots, two wait for the
    // in-flight blocks to settle; nothing assigned is ever victimized
    let burst: [Addr; 4] = [0x200, 0x280, 0x300, 0x380];
    let ids: Vec<EventId> = burst.iter().map(|&a| cpu_read(&sys, 0, "cpu0", a)).collect();
    run(&mut sys);
    for id in &ids {
        assert!(response(&sys, *id).is_some());
    }
    assert!(sys.caches[0].quiescent());
}

#[test]
fn test_concurrent_misses_coalesce() {
    let mut sys = single_cache_system(params());

    let id0 = cpu_read(&sys, 0, "cpu0", 0x100);
    let id1 = cpu_read(&sys, 0, "cpu0", 0x104);
    run(&mut sys);

    assert!(response(&sys, id0).is_some());
    assert!(response(&sys, id1).is_some());
    // one outstanding load served both misses
    assert_eq!(sys.mem.as_ref().unwrap().num_supplies, 1);
}

#[test]
fn test_repeated_invalidate_is_acked_idempotently() {
    let mut sys = single_cache_system(CacheParams {
        is_l1: true,
        ..params()
    });

    for seq in 0..2u64 {
        let inv = MemEvent::new((80_000 + seq, 50), "dir0", 0x500, MemCmd::Invalidate);
        sys.inject(Msg::ToCache(0, CacheMsg::Link(inv, Source::Directory)));
        run(&mut sys);
    }
    let acks: Vec<_> = sys
        .dir_outbox
        .iter()
        .map(|(_, ev)| ev)
        .filter(|ev| ev.cmd == MemCmd::ACK)
        .collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(sys.caches[0].block_status(0x500), None);
    assert!(sys.caches[0].quiescent());
}

#[test]
fn test_invalidate_forwards_upstream_and_acks() {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, MEM_LAT);
    let mut p = params();
    p.num_upstream = 2;
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0), Wire::Proc(1)],
        downstream: Some(Wire::Mem),
        directory: false,
    };
    let idx = sys.add_cache("l2", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l2", Wire::CacheDownstream { id: idx });

    let inv = MemEvent::new((80_010, 50), "memory", 0x80, MemCmd::Invalidate);
    sys.inject(Msg::ToCache(0, CacheMsg::Link(inv, Source::Downstream)));
    run(&mut sys);

    // forwarded on both upstream links before answering downstream
    let forwarded: Vec<MemEvent> = sys
        .cpu_outbox
        .iter()
        .map(|(_, ev)| ev.clone())
        .filter(|ev| ev.cmd == MemCmd::Invalidate)
        .collect();
    assert_eq!(forwarded.len(), 2);

    for (i, f) in forwarded.iter().enumerate() {
        let mut ack = f.make_response((80_020 + i as u64, 50), &format!("l1_{}", i));
        ack.link_id = i;
        sys.inject(Msg::ToCache(0, CacheMsg::Link(ack, Source::Upstream)));
    }
    run(&mut sys);
    assert!(sys.caches[0].quiescent());
}

#[test]
fn test_nack_cancels_invalidation_and_reissues() {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, MEM_LAT);
    let mut p = params();
    p.is_l1 = true;
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0)],
        downstream: Some(Wire::Mem),
        directory: true,
    };
    let idx = sys.add_cache("l1", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l1", Wire::CacheDownstream { id: idx });
    sys.caches[0].set_directory_peers(vec![DirEntry {
        range_start: 0,
        range_end: 0x10000,
        interleave_size: 0,
        interleave_step: 0,
        name: "dir0".to_string(),
    }]);

    let rd = cpu_read(&sys, 0, "cpu0", 0x600);
    run(&mut sys);
    assert!(response(&sys, rd).is_some());

    // the upgrade stalls on the directory's acknowledgment
    let wr = cpu_write(&sys, 0, "cpu0", 0x600, vec![7; 4]);
    run(&mut sys);
    assert!(response(&sys, wr).is_none());
    let inv = sys
        .dir_outbox
        .iter()
        .map(|(_, ev)| ev.clone())
        .find(|ev| ev.cmd == MemCmd::Invalidate)
        .unwrap();

    // refuse it; being L1, the cache must retry the write itself
    let mut nack = inv.make_response((80_030, 50), "dir0");
    nack.cmd = MemCmd::NACK;
    nack.size = 0;
    sys.inject(Msg::ToCache(0, CacheMsg::Link(nack, Source::Directory)));
    run(&mut sys);

    let invs: Vec<MemEvent> = sys
        .dir_outbox
        .iter()
        .map(|(_, ev)| ev.clone())
        .filter(|ev| ev.cmd == MemCmd::Invalidate)
        .collect();
    assert_eq!(invs.len(), 2, "invalidate was not reissued");

    let ack = invs[1].make_response((80_031, 50), "dir0");
    sys.inject(Msg::ToCache(0, CacheMsg::Link(ack, Source::Directory)));
    run(&mut sys);
    assert!(response(&sys, wr).is_some());
    assert_eq!(
        sys.caches[0].block_status(0x600),
        Some(BlockStatus::Exclusive)
    );
}

#[test]
fn test_write_race_resolves_to_single_owner() {
    let mut sys = bus_system(2, MEM_LAT);
    sys.mem.as_mut().unwrap().poke(0x500, vec![0; 64]);

    // both caches pick up the line shared
    let rd0 = cpu_read(&sys, 0, "cpu0", 0x500);
    run(&mut sys);
    let rd1 = cpu_read(&sys, 1, "cpu1", 0x500);
    run(&mut sys);
    assert!(response(&sys, rd0).is_some());
    assert!(response(&sys, rd1).is_some());

    // racing upgrades to different words of the same block
    let wr0 = cpu_write(&sys, 0, "cpu0", 0x500, vec![0x11; 4]);
    let wr1 = cpu_write(&sys, 1, "cpu1", 0x504, vec![0x22; 4]);
    run(&mut sys);
    assert!(response(&sys, wr0).is_some());
    assert!(response(&sys, wr1).is_some());

    // at most one cache may report the line exclusive or dirty
    let owners = sys
        .caches
        .iter()
        .filter(|c| {
            matches!(
                c.block_status(0x500),
                Some(BlockStatus::Exclusive) | Some(BlockStatus::Dirty)
            )
        })
        .count();
    assert!(owners <= 1, "coherence violated: {} owners", owners);

    // neither write was lost
    let rd = cpu_read(&sys, 1, "cpu1", 0x500);
    let rd_hi = cpu_read(&sys, 1, "cpu1", 0x504);
    run(&mut sys);
    assert_eq!(response(&sys, rd).unwrap().payload, vec![0x11; 4]);
    assert_eq!(response(&sys, rd_hi).unwrap().payload, vec![0x22; 4]);
}

#[test]
fn test_delayed_snoop_fill_purges_load() {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, 50);
    let mut p = params();
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0)],
        downstream: Some(Wire::Mem),
        directory: false,
    };
    let idx = sys.add_cache("l2", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l2", Wire::CacheDownstream { id: idx });

    // a snooped peer request addressed to us starts a load on its behalf
    let mut req = MemEvent::new((80_040, 50), "peer1", 0x700, MemCmd::RequestData);
    req.size = BLOCKSIZE;
    req.dst = "l2".to_string();
    sys.inject(Msg::ToCache(0, CacheMsg::Link(req, Source::Snoop)));
    let t = sys.time();
    sys.run_until(t + 10);
    assert_eq!(sys.caches[0].block_status(0x700), Some(BlockStatus::Assigned));

    // a delayed supply snooped off the bus removes every snoop-sourced
    // reason to load; the reservation is rolled back
    let mut delayed = MemEvent::new((80_041, 50), "peer2", 0x700, MemCmd::SupplyData);
    delayed.size = BLOCKSIZE;
    delayed.set_flag(MemFlags::DELAYED);
    sys.inject(Msg::ToCache(0, CacheMsg::Link(delayed, Source::Snoop)));
    run(&mut sys);

    assert_eq!(sys.caches[0].block_status(0x700), None);
    assert!(sys.caches[0].quiescent());
}

#[test]
fn test_inclusive_writeback_from_above() {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, MEM_LAT);
    let mut p = params();
    p.mode = CacheMode::Inclusive;
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0)],
        downstream: Some(Wire::Mem),
        directory: false,
    };
    let idx = sys.add_cache("l2", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l2", Wire::CacheDownstream { id: idx });

    // the upper level misses into us
    let mut req = MemEvent::new((80_050, 50), "l1_above", 0x600, MemCmd::RequestData);
    req.size = BLOCKSIZE;
    sys.inject(Msg::ToCache(0, CacheMsg::Link(req, Source::Upstream)));
    run(&mut sys);
    assert_eq!(sys.caches[0].block_status(0x600), Some(BlockStatus::Shared));
    assert!(sys
        .cpu_outbox
        .iter()
        .any(|(_, ev)| ev.cmd == MemCmd::SupplyData));

    // an invalidate from above forwards down, then marks the line dirty:
    // the upper level still owes us the data
    let inv = MemEvent::new((80_051, 50), "l1_above", 0x600, MemCmd::Invalidate);
    sys.inject(Msg::ToCache(0, CacheMsg::Link(inv, Source::Upstream)));
    run(&mut sys);
    assert_eq!(sys.caches[0].block_status(0x600), Some(BlockStatus::Dirty));
    assert!(sys
        .cpu_outbox
        .iter()
        .any(|(_, ev)| ev.cmd == MemCmd::ACK));

    // the writeback from above refreshes the line and moves on downstream
    let mut wb = MemEvent::new((80_052, 50), "l1_above", 0x600, MemCmd::SupplyData);
    wb.size = BLOCKSIZE;
    wb.set_flag(MemFlags::WRITEBACK);
    wb.payload = vec![0x77; 64];
    sys.inject(Msg::ToCache(0, CacheMsg::Link(wb, Source::Upstream)));
    run(&mut sys);
    assert_eq!(sys.caches[0].block_status(0x600), Some(BlockStatus::Shared));
    assert_eq!(sys.caches[0].block_data(0x600).unwrap(), &[0x77u8; 64][..]);
    assert_eq!(sys.mem.as_ref().unwrap().peek(0x600).unwrap(), &[0x77u8; 64][..]);
}

#[test]
fn test_inclusive_eviction_invalidates_upstream() {
    let mut sys = System::new();
    sys.add_memory("memory", BLOCKSIZE, MEM_LAT);
    let mut p = params();
    p.num_ways = 1;
    p.mode = CacheMode::Inclusive;
    p.set_next_level("memory");
    let links = CacheLinks {
        upstream: vec![Wire::Proc(0)],
        downstream: Some(Wire::Mem),
        directory: false,
    };
    let idx = sys.add_cache("l2", p, links).unwrap();
    sys.mem
        .as_mut()
        .unwrap()
        .add_port("l2", Wire::CacheDownstream { id: idx });

    // fill the single way of row 0
    let mut req = MemEvent::new((80_060, 50), "l1_above", 0x000, MemCmd::RequestData);
    req.size = BLOCKSIZE;
    sys.inject(Msg::ToCache(0, CacheMsg::Link(req, Source::Upstream)));
    run(&mut sys);
    assert_eq!(sys.caches[0].block_status(0x000), Some(BlockStatus::Shared));

    // a conflicting fill must first invalidate the upstream copy of the victim
    let mut req = MemEvent::new((80_061, 50), "l1_above", 0x080, MemCmd::RequestData);
    req.size = BLOCKSIZE;
    sys.inject(Msg::ToCache(0, CacheMsg::Link(req, Source::Upstream)));
    run(&mut sys);
    let up_inv = sys
        .cpu_outbox
        .iter()
        .map(|(_, ev)| ev.clone())
        .find(|ev| ev.cmd == MemCmd::Invalidate && ev.addr == 0x000)
        .expect("no upstream invalidate for the victim");
    let mut ack = up_inv.make_response((80_062, 50), "l1_above");
    ack.link_id = 0;
    sys.inject(Msg::ToCache(0, CacheMsg::Link(ack, Source::Upstream)));
    run(&mut sys);

    assert_eq!(sys.caches[0].block_status(0x000), None);
    assert_eq!(sys.caches[0].block_status(0x080), Some(BlockStatus::Shared));
    assert!(sys.caches[0].quiescent());
}
