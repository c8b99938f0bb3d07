//! The TCP core: per-connection protocol state (`tcb`), segment
//! construction/transmission (`ioutil`), sequence-number arithmetic (`seq`),
//! the retransmit/delayed-ACK/linger timer service (`timer`), and the
//! blocking `TcpListener`/`TcpStream` facades the rest of the crate drives.

use std::net::Ipv4Addr;

mod ioutil;
mod listen;
mod seq;
mod stream;
mod tcb;
mod timer;

pub use ioutil::*;
pub use listen::*;
pub use stream::*;
pub use tcb::{Action, Kind, RecvSpace, SendSpace, State, TCB};
pub use timer::{Fired, TimerId, TimerKind, TimerService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}
