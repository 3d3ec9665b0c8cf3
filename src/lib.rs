/*
    A discrete-event simulator for coherent multi-level memory hierarchies.

    A `Cache` sits between upstream requesters (CPUs or higher-level caches)
    and a downstream memory (a lower cache, a directory controller, or a
    snoopy bus).  Components exchange `MemEvent`s through a delayed message
    queue; each handler runs to completion and defers work by sending
    itself a message at a later simulation time.
 */

pub mod delayed_q;
pub mod commons;
pub mod bus;
pub mod cache;
pub mod memory;
pub mod processor;
pub mod system;
