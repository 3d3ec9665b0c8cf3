use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;

use crate::bus::BusMsg;
use crate::cache::CacheMsg;
use crate::memory::MemMsg;
use crate::processor::ProcMsg;

// addresses and event ids

pub type Addr = u64;

/// unique event identity: (sequence number, issuing component)
pub type EventId = (u64, u32);

pub const NO_ID: EventId = (0, 0);

// commands and flags

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemCmd {
    ReadReq,
    WriteReq,
    RequestData,
    SupplyData,
    Invalidate,
    ACK,
    NACK,
    Fetch,
    FetchInvalidate,
    BusClearToSend,
}

impl MemCmd {
    /// command carried by a response to this command
    pub fn response_cmd(&self) -> MemCmd {
        match self {
            MemCmd::ReadReq
            | MemCmd::RequestData
            | MemCmd::Fetch
            | MemCmd::FetchInvalidate => MemCmd::SupplyData,
            _ => MemCmd::ACK,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct MemFlags: u32 {
        /// propagation of modified data; no response expected
        const WRITEBACK = 1 << 0;
        /// CPU atomic-lock request
        const LOCKED = 1 << 1;
        /// supplier will produce the real data later
        const DELAYED = 1 << 2;
    }
}

// events

/// the one structure carried over every link surface
#[derive(Clone, Debug)]
pub struct MemEvent {
    pub id: EventId,
    pub response_to: EventId,
    pub cmd: MemCmd,
    pub src: String,
    pub dst: String,
    pub addr: Addr,
    pub base_addr: Addr,
    pub size: u32,
    pub flags: MemFlags,
    pub payload: Vec<u8>,
    /// upstream link index the event arrived on, filled in at delivery
    pub link_id: usize,
}

impl MemEvent {
    pub fn new(id: EventId, src: &str, addr: Addr, cmd: MemCmd) -> Self {
        MemEvent {
            id,
            response_to: NO_ID,
            cmd,
            src: src.to_string(),
            dst: String::new(),
            addr,
            base_addr: addr,
            size: 0,
            flags: MemFlags::empty(),
            payload: Vec::new(),
            link_id: 0,
        }
    }
    /// response addressed back to the sender of `self`
    pub fn make_response(&self, id: EventId, responder: &str) -> MemEvent {
        MemEvent {
            id,
            response_to: self.id,
            cmd: self.cmd.response_cmd(),
            src: responder.to_string(),
            dst: self.src.clone(),
            addr: self.addr,
            base_addr: self.base_addr,
            size: self.size,
            flags: MemFlags::empty(),
            payload: Vec::new(),
            link_id: 0,
        }
    }
    pub fn query_flag(&self, flag: MemFlags) -> bool {
        self.flags.contains(flag)
    }
    pub fn set_flag(&mut self, flag: MemFlags) {
        self.flags.insert(flag);
    }
}

/// which of the five logical link surfaces an event arrived on
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Source {
    Upstream,
    Downstream,
    Snoop,
    Directory,
    Prefetcher,
    SelfLink,
}

/// egress selector for invalidates and loads
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ForwardDir {
    Up,
    Down,
    Both,
}

// configuration

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheMode {
    Standard,
    Inclusive,
    Exclusive,
}

impl FromStr for CacheMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_uppercase().as_str() {
            "STANDARD" => Ok(CacheMode::Standard),
            "INCLUSIVE" => Ok(CacheMode::Inclusive),
            "EXCLUSIVE" => Ok(CacheMode::Exclusive),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("num_ways, num_rows and blocksize must all be > 0")]
    ZeroSize,
    #[error("num_rows must be a power of two, got {0}")]
    RowsNotPowerOfTwo(u32),
    #[error("blocksize must be a power of two, got {0}")]
    BlocksizeNotPowerOfTwo(u32),
    #[error("cache mode EXCLUSIVE not yet implemented")]
    ExclusiveUnimplemented,
    #[error("cache mode must be one of STANDARD, INCLUSIVE or EXCLUSIVE, got `{0}`")]
    UnknownMode(String),
    #[error("prefetcher `{0}` could not be loaded")]
    UnknownPrefetcher(String),
    #[error("invalid value `{value}` for parameter `{key}`")]
    BadValue { key: &'static str, value: String },
}

pub const NO_NEXT_LEVEL: &str = "NONE";

#[derive(Clone, Debug)]
pub struct CacheParams {
    pub num_ways: u32,
    pub num_rows: u32,
    pub blocksize: u32,
    pub mode: CacheMode,
    /// self-link latency, in simulation time units
    pub access_time: u64,
    pub num_upstream: usize,
    /// symbolic name of the next level, or None for "NONE"
    pub next_level: Option<String>,
    pub net_addr: u64,
    /// explicit L1 role; the role is otherwise detected on the first
    /// CPU request, which is fragile under prefetcher-only traffic
    pub is_l1: bool,
}

impl Default for CacheParams {
    fn default() -> Self {
        CacheParams {
            num_ways: 2,
            num_rows: 64,
            blocksize: 32,
            mode: CacheMode::Standard,
            access_time: 1,
            num_upstream: 1,
            next_level: None,
            net_addr: 0,
            is_l1: false,
        }
    }
}

impl CacheParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_ways == 0 || self.num_rows == 0 || self.blocksize == 0 {
            return Err(ConfigError::ZeroSize);
        }
        if !self.num_rows.is_power_of_two() {
            return Err(ConfigError::RowsNotPowerOfTwo(self.num_rows));
        }
        if !self.blocksize.is_power_of_two() {
            return Err(ConfigError::BlocksizeNotPowerOfTwo(self.blocksize));
        }
        if self.mode == CacheMode::Exclusive {
            return Err(ConfigError::ExclusiveUnimplemented);
        }
        Ok(())
    }
    pub fn set_next_level(&mut self, name: &str) {
        self.next_level = if name == NO_NEXT_LEVEL || name.is_empty() {
            None
        } else {
            Some(name.to_string())
        };
    }
}

// instructions

#[derive(Clone)]
pub enum Instr {
    Read(Addr),
    Write(Addr),
    Other(u64),
}

pub type Instructions = VecDeque<Instr>;

// messages

/// top-level routing envelope; the system loop forwards each variant to
/// the owning component
pub enum Msg {
    ToCache(usize, CacheMsg),
    ToProc(usize, ProcMsg),
    ToBus(BusMsg),
    ToMem(MemMsg),
    /// event sent on a cache's directory link, collected by the harness
    ToDirectory(usize, MemEvent),
    /// bus-probe copy of a broadcast, collected by the harness
    ToProbe(MemEvent),
}

pub trait MsgHandler<MsgT> {
    fn handle_msg(&mut self, msg: MsgT);
}

/// one endpoint of a point-to-point connection, from the receiver's
/// point of view
#[derive(Clone, Debug)]
pub enum Wire {
    CacheUpstream { id: usize, link: usize },
    CacheDownstream { id: usize },
    CacheDirectory { id: usize },
    Proc(usize),
    Mem,
}

impl Wire {
    /// wrap `ev` for delivery at this endpoint
    pub fn deliver(&self, mut ev: MemEvent) -> Msg {
        match self {
            Wire::CacheUpstream { id, link } => {
                ev.link_id = *link;
                Msg::ToCache(*id, CacheMsg::Link(ev, Source::Upstream))
            }
            Wire::CacheDownstream { id } => {
                Msg::ToCache(*id, CacheMsg::Link(ev, Source::Downstream))
            }
            Wire::CacheDirectory { id } => {
                Msg::ToCache(*id, CacheMsg::Link(ev, Source::Directory))
            }
            Wire::Proc(id) => Msg::ToProc(*id, ProcMsg::Resp(ev)),
            Wire::Mem => Msg::ToMem(MemMsg::Link(ev, false)),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Upstream => "upstream",
            Source::Downstream => "downstream",
            Source::Snoop => "snoop",
            Source::Directory => "directory",
            Source::Prefetcher => "prefetcher",
            Source::SelfLink => "self",
        };
        write!(f, "{}", s)
    }
}

/// abort the simulation with context; used for protocol violations that
/// indicate a bug in the surrounding coherence design
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        log::logger().flush();
        panic!($($arg)*)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation() {
        let mut p = CacheParams::default();
        assert!(p.validate().is_ok());

        p.num_rows = 3;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::RowsNotPowerOfTwo(3))
        ));

        p.num_rows = 4;
        p.blocksize = 0;
        assert!(matches!(p.validate(), Err(ConfigError::ZeroSize)));

        p.blocksize = 64;
        p.mode = CacheMode::Exclusive;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::ExclusiveUnimplemented)
        ));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("inclusive".parse::<CacheMode>().unwrap(), CacheMode::Inclusive);
        assert_eq!("STANDARD".parse::<CacheMode>().unwrap(), CacheMode::Standard);
        assert!("WRITEBACK".parse::<CacheMode>().is_err());
    }

    #[test]
    fn test_response_routing() {
        let mut req = MemEvent::new((7, 1), "cpu0", 0x140, MemCmd::ReadReq);
        req.size = 4;
        let resp = req.make_response((8, 2), "l1");
        assert_eq!(resp.response_to, (7, 1));
        assert_eq!(resp.cmd, MemCmd::SupplyData);
        assert_eq!(resp.dst, "cpu0");
        assert_eq!(resp.src, "l1");
    }
}
