use std::cmp;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use tidy_tuntap::Tun;

use crate::err::ErrorKind;
use crate::Manager;

use super::{Quad, TimerService};

#[derive(Debug)]
pub struct TcpStream {
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) tun: Arc<Mutex<Tun>>,
    pub(crate) timers: Arc<TimerService>,
    pub(crate) quad: Quad,
    pub(crate) rvar: Arc<Condvar>,
    pub(crate) wvar: Arc<Condvar>,
    pub(crate) svar: Arc<Condvar>,
    pub(crate) closed: bool,
}

fn to_io_err(err: &ErrorKind) -> io::Error {
    let kind = match err {
        ErrorKind::ConnectionReset => io::ErrorKind::ConnectionReset,
        ErrorKind::ConnectionRefused => io::ErrorKind::ConnectionRefused,
        ErrorKind::TimedOut => io::ErrorKind::TimedOut,
        ErrorKind::NotConnected => io::ErrorKind::NotConnected,
    };
    io::Error::new(kind, err.to_string())
}

impl TcpStream {
    /// Enqueue a FIN and return immediately; does not wait for the peer's
    /// FIN/ACK or for TIME-WAIT to elapse. The TCB lingers in `streams`
    /// under the manager lock until the timer service's linger callback
    /// deletes it, independent of this handle's lifetime.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();
        if let Some(entry) = manager.streams.get_mut(&self.quad) {
            let mut tun = self.tun.lock().unwrap();
            entry.tcb.close(&mut tun, &self.timers);
        }
    }

    /// Abandon the connection immediately: send an unsolicited RST and drop
    /// the TCB from the manager's tables without waiting for anything.
    /// Per spec.md S7, this is the "hard" counterpart to the graceful
    /// `close`.
    pub fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();
        if let Some(entry) = manager.streams.remove(&self.quad) {
            let mut tun = self.tun.lock().unwrap();
            super::write_abort(&self.quad, entry.tcb.snd.nxt, entry.tcb.rcv.nxt, &mut *tun);
        }
        drop(manager);

        self.rvar.notify_all();
        self.wvar.notify_all();
        self.svar.notify_all();
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .rvar
            .wait_while(manager, |manager| match manager.streams.get(&self.quad) {
                Some(entry) => entry.tcb.err.is_none() && entry.tcb.incoming.is_empty() && !entry.tcb.read_closed,
                None => false,
            })
            .unwrap();

        let entry = manager
            .streams
            .get_mut(&self.quad)
            .ok_or_else(|| to_io_err(&ErrorKind::NotConnected))?;

        if let Some(err) = &entry.tcb.err {
            return Err(to_io_err(err));
        }

        Ok(entry.tcb.recv(buf))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(to_io_err(&ErrorKind::NotConnected));
        }

        let mut manager = self.manager.lock().unwrap();

        manager = self
            .wvar
            .wait_while(manager, |manager| match manager.streams.get(&self.quad) {
                Some(entry) => entry.tcb.err.is_none() && entry.tcb.is_outgoing_full(),
                None => false,
            })
            .unwrap();

        let entry = manager
            .streams
            .get_mut(&self.quad)
            .ok_or_else(|| to_io_err(&ErrorKind::NotConnected))?;

        if let Some(err) = &entry.tcb.err {
            return Err(to_io_err(err));
        }

        let outgoing = &mut entry.tcb.outgoing;
        let len = cmp::min(buf.len(), outgoing.capacity() - outgoing.len());
        outgoing.extend(buf[..len].iter());

        let mut tun = self.tun.lock().unwrap();
        entry.tcb.try_send(&mut tun, &self.timers);

        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .wvar
            .wait_while(manager, |manager| match manager.streams.get(&self.quad) {
                Some(entry) => entry.tcb.err.is_none() && !entry.tcb.outgoing.is_empty(),
                None => false,
            })
            .unwrap();

        match manager.streams.get(&self.quad).and_then(|entry| entry.tcb.err.as_ref()) {
            Some(err) => Err(to_io_err(err)),
            None => Ok(()),
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}
