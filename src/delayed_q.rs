// implements a message queue with discrete message delays

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

// delayed message type

#[derive(Clone)]
pub struct DelayedMsg<MsgType> {
    pub t: u64,
    pub msg: MsgType,
}

/*
    In TimedMsg, `t` stands for the timestamp at which the message becomes
    available, whereas `t` in DelayedMsg stands for the delay of the message
    from the time of issue.
 */

struct TimedMsg<MsgType> {
    t: u64,
    msg: MsgType,
}

struct QueueState<MsgType> {
    time: u64,
    next_seq: u64,
    q: VecDeque<TimedMsg<MsgType>>,
}

// sender handle, cloneable and shared by every component.
// besides enqueuing it exposes the current simulation time and hands out
// event sequence numbers, so components never reach for global state.

pub struct DelQSender<MsgType> {
    q: Rc<RefCell<QueueState<MsgType>>>,
}

impl<MsgType> Clone for DelQSender<MsgType> {
    fn clone(&self) -> Self {
        DelQSender { q: self.q.clone() }
    }
}

impl<MsgType> DelQSender<MsgType> {
    pub fn send(&self, msg: DelayedMsg<MsgType>) {
        let mut queue = self.q.borrow_mut();
        let timed = TimedMsg {
            t: queue.time + msg.t,
            msg: msg.msg,
        };
        // keep the queue sorted by timestamp, FIFO among equal timestamps
        let pos = queue
            .q
            .iter()
            .position(|m| m.t > timed.t)
            .unwrap_or(queue.q.len());
        queue.q.insert(pos, timed);
    }
    pub fn now(&self) -> u64 {
        self.q.borrow().time
    }
    pub fn alloc_seq(&self) -> u64 {
        let mut queue = self.q.borrow_mut();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        seq
    }
}

// delayed message queue

pub struct DelayedQ<MsgType> {
    q: Rc<RefCell<QueueState<MsgType>>>,
}

impl<MsgType> DelayedQ<MsgType> {
    pub fn new() -> (DelayedQ<MsgType>, DelQSender<MsgType>) {
        let state = Rc::new(RefCell::new(QueueState {
            time: 0,
            next_seq: 0,
            q: VecDeque::new(),
        }));
        let sender = DelQSender { q: state.clone() };
        (DelayedQ { q: state }, sender)
    }
    /// timestamp of the next pending message, if any
    pub fn next_time(&self) -> Option<u64> {
        self.q.borrow().q.front().map(|m| m.t)
    }
    /// advance the clock to `new_time`; messages due earlier stay fetchable
    pub fn update_time(&mut self, new_time: u64) {
        let mut state = self.q.borrow_mut();
        if new_time > state.time {
            state.time = new_time;
        }
    }
    /// fetch the next message that is due at or before the current time
    pub fn try_fetch(&mut self) -> Option<MsgType> {
        let mut state = self.q.borrow_mut();
        if let Some(m) = state.q.front() {
            if m.t > state.time {
                return None;
            }
        }
        state.q.pop_front().map(|m| m.msg)
    }
    pub fn is_empty(&self) -> bool {
        self.q.borrow().q.is_empty()
    }
    pub fn msg_available(&self) -> bool {
        !self.is_empty()
    }
}

// testing
