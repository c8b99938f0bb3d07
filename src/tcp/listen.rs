use std::sync::{Arc, Condvar, Mutex};

use tidy_tuntap::Tun;

use crate::err::TcpError;
use crate::{EstabElement, Manager};

use super::stream::TcpStream;
use super::TimerService;

#[derive(Debug)]
pub struct TcpListener {
    pub(crate) port: u16,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) tun: Arc<Mutex<Tun>>,
    pub(crate) timers: Arc<TimerService>,
    pub(crate) cvar: Arc<Condvar>,
}

impl TcpListener {
    pub fn accept(&self) -> Result<TcpStream, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .cvar
            .wait_while(manager, |manager| {
                manager
                    .established
                    .get(&self.port)
                    .is_some_and(|entry| entry.elts.is_empty())
            })
            .unwrap();

        let establisheds = manager
            .established
            .get_mut(&self.port)
            .ok_or(TcpError::PortClosed(self.port))?;

        let EstabElement { quad, rvar, wvar, svar } = establisheds.elts.pop().unwrap();

        Ok(TcpStream {
            manager: self.manager.clone(),
            tun: self.tun.clone(),
            timers: self.timers.clone(),
            quad,
            rvar,
            wvar,
            svar,
            closed: false,
        })
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();

        manager.established.remove(&self.port);
        assert!(manager.bounded.remove(&self.port));
    }
}
