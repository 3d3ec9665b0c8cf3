// CPU driver: replays an instruction trace against its cache, one
// outstanding request at a time

use log::{debug, warn};

use crate::commons::{EventId, Instr, Instructions, MemCmd, MemEvent, Msg, MsgHandler, Wire};
use crate::delayed_q::{DelQSender, DelayedMsg};

type DelQMsgSender = DelQSender<Msg>;

const WORD_SIZE: u32 = 4;

pub enum ProcMsg {
    Start,
    Resp(MemEvent),
    Nudge,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum ProcState {
    Ready,
    WaitingForCache,
    ExecutingOther,
    Done,
}

pub struct Processor {
    pub id: usize,
    comp: u32,
    name: String,
    tx: DelQMsgSender,
    cache: Wire,
    instructions: Instructions,
    state: ProcState,
    outstanding: Option<EventId>,
    issue_time: u64,

    pub num_loads: u64,
    pub num_stores: u64,
    pub num_wait_time: u64,
}

impl Processor {
    pub fn new(
        id: usize,
        comp: u32,
        name: &str,
        instructions: Instructions,
        cache: Wire,
        tx: DelQMsgSender,
    ) -> Self {
        Processor {
            id,
            comp,
            name: name.to_string(),
            tx,
            cache,
            instructions,
            state: ProcState::Ready,
            outstanding: None,
            issue_time: 0,
            num_loads: 0,
            num_stores: 0,
            num_wait_time: 0,
        }
    }
    pub fn done(&self) -> bool {
        self.state == ProcState::Done
    }
    pub fn name(&self) -> &str {
        &self.name
    }

    fn send_cache(&self, ev: MemEvent) {
        self.tx.send(DelayedMsg {
            t: 1,
            msg: self.cache.deliver(ev),
        });
    }
    fn send_self(&self, msg: ProcMsg, delay: u64) {
        self.tx.send(DelayedMsg {
            t: delay,
            msg: Msg::ToProc(self.id, msg),
        });
    }

    fn issue_next(&mut self) {
        self.state = match self.instructions.pop_front() {
            Some(Instr::Read(addr)) => {
                self.num_loads += 1;
                let mut ev = MemEvent::new(
                    (self.tx.alloc_seq(), self.comp),
                    &self.name,
                    addr,
                    MemCmd::ReadReq,
                );
                ev.size = WORD_SIZE;
                self.outstanding = Some(ev.id);
                self.issue_time = self.tx.now();
                self.send_cache(ev);
                ProcState::WaitingForCache
            }
            Some(Instr::Write(addr)) => {
                self.num_stores += 1;
                let mut ev = MemEvent::new(
                    (self.tx.alloc_seq(), self.comp),
                    &self.name,
                    addr,
                    MemCmd::WriteReq,
                );
                ev.size = WORD_SIZE;
                ev.payload = (addr as u32).to_le_bytes().to_vec();
                self.outstanding = Some(ev.id);
                self.issue_time = self.tx.now();
                self.send_cache(ev);
                ProcState::WaitingForCache
            }
            Some(Instr::Other(time)) => {
                self.send_self(ProcMsg::Nudge, time);
                ProcState::ExecutingOther
            }
            None => {
                debug!("{}: done at t={}", self.name, self.tx.now());
                ProcState::Done
            }
        }
    }
}

impl MsgHandler<ProcMsg> for Processor {
    fn handle_msg(&mut self, msg: ProcMsg) {
        match (self.state, msg) {
            (ProcState::Ready, ProcMsg::Start) => self.issue_next(),
            (ProcState::WaitingForCache, ProcMsg::Resp(ev)) => {
                if Some(ev.response_to) != self.outstanding {
                    warn!("{}: response to unknown request, ignoring", self.name);
                    return;
                }
                self.outstanding = None;
                self.num_wait_time += self.tx.now() - self.issue_time;
                self.issue_next();
            }
            (ProcState::ExecutingOther, ProcMsg::Nudge) => self.issue_next(),
            (ProcState::Done, _) => (),
            _ => warn!("{}: message in invalid state {:?}", self.name, self.state),
        }
    }
}
