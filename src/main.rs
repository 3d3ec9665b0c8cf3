/*
    Trace-driven simulation of N CPU+cache pairs on a snoop bus with a
    bus-attached memory as the next level.

    Usage: cachesim-mh <testname> [num_ways num_rows blocksize]

    Reads all files under ./traces/ whose names start with <testname> and
    end with .data, one file per CPU, with lines "<op> <hex value>" where
    op 0 = read, 1 = write, 2 = busy for <value> time units.
 */

use std::collections::VecDeque;
use std::env;
use std::fs;
use std::fs::File;
use std::io::Read;
use std::time::Instant;

use env_logger::Env;

use cachesim_mh::commons::{Addr, CacheParams, ConfigError, Instr, Instructions};
use cachesim_mh::system::System;

const MEM_LAT: u64 = 100;

fn read_testfiles(testname: &str) -> Vec<Instructions> {
    // reads all trace files that begin with testname; one per processor,
    // the order is currently undefined
    let mut insts = Vec::new();
    let paths = fs::read_dir("traces/").expect("no traces/ directory");
    for path in paths.filter_map(|p| p.ok()).filter(|p| {
        let name = p.file_name();
        let name = name.to_str().unwrap_or("");
        name.starts_with(testname) && name.ends_with(".data")
    }) {
        println!("reading file: {:?}", path.file_name());
        let mut f = File::open(path.path()).expect("cannot open trace file");
        let mut s = String::new();
        f.read_to_string(&mut s).expect("cannot read trace file");
        let mut insts_for_proc = VecDeque::new();
        for line in s.lines() {
            let mut parts = line.split_whitespace();
            let inst = parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .expect("bad instruction");
            let val = parts
                .next()
                .and_then(|p| u64::from_str_radix(p.trim_start_matches("0x"), 16).ok())
                .expect("bad value");
            insts_for_proc.push_back(match inst {
                0 => Instr::Read(val as Addr),
                1 => Instr::Write(val as Addr),
                2 => Instr::Other(val),
                _ => panic!("invalid instruction"),
            });
        }
        insts.push(insts_for_proc);
    }
    println!("done");
    insts
}

fn parse_params(args: &[String]) -> Result<CacheParams, ConfigError> {
    let mut params = CacheParams {
        blocksize: 64,
        is_l1: true,
        ..Default::default()
    };
    if args.len() > 4 {
        params.num_ways = args[2].parse().map_err(|_| ConfigError::BadValue {
            key: "num_ways",
            value: args[2].clone(),
        })?;
        params.num_rows = args[3].parse().map_err(|_| ConfigError::BadValue {
            key: "num_rows",
            value: args[3].clone(),
        })?;
        params.blocksize = args[4].parse().map_err(|_| ConfigError::BadValue {
            key: "blocksize",
            value: args[4].clone(),
        })?;
    }
    params.validate()?;
    Ok(params)
}

fn main() {
    let env = Env::default().filter_or("CACHESIM_LOG", "info");
    env_logger::init_from_env(env);

    let args: Vec<String> = env::args().collect();
    let testname = if args.len() > 1 { args[1].as_str() } else { "custom" };
    let params = match parse_params(&args) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let insts = read_testfiles(testname);
    if insts.is_empty() {
        eprintln!("no trace files found for `{}`", testname);
        std::process::exit(1);
    }

    println!("initializing simulation...");
    let n = insts.len();
    let mut sys = match System::smp(n, &params, MEM_LAT, insts) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    println!("done. starting simulation");
    let t0 = Instant::now();
    sys.start_procs();
    let drained = sys.run(usize::MAX);
    let t1 = Instant::now();

    if !drained || !sys.procs.iter().all(|p| p.done()) {
        eprintln!("simulation stalled; dumping cache state");
        for cache in &sys.caches {
            eprintln!("{}", cache.dump());
        }
        std::process::exit(1);
    }

    println!("done! simulated time: {}", sys.time());
    for p in &sys.procs {
        println!(
            "{}: {} loads, {} stores, {} time units waiting",
            p.name(),
            p.num_loads,
            p.num_stores,
            p.num_wait_time
        );
    }
    sys.finish();
    println!("execution time {:?}", t1 - t0);
}
