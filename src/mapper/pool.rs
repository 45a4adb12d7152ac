//! Host port pool.
//!
//! TCP and UDP ports are tracked separately; each protocol has its own set of
//! bound ports inside the shared range. Allocation hands out ports round-robin
//! from a cursor so a port released a moment ago is not immediately reused.

use crate::error::{PortError, PortFailure};
use crate::template::model::Protocol;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Port allocation collaborator.
pub trait PortAllocator: Send + Sync {
    /// Bind a host port, the preferred one when given.
    fn bind(&self, protocol: Protocol, preferred: Option<u16>) -> Result<u16, PortError>;

    /// Return a port to the pool. Releasing an unbound port is a no-op.
    fn release(&self, protocol: Protocol, port: u16);

    /// Number of ports currently bound across protocols.
    fn in_use(&self) -> usize;
}

#[derive(Debug, Default)]
struct PoolState {
    tcp: HashSet<u16>,
    udp: HashSet<u16>,
    cursor: u16,
}

impl PoolState {
    fn used(&mut self, protocol: Protocol) -> &mut HashSet<u16> {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }
}

/// In-memory pool over a fixed host port range.
#[derive(Debug)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self::from_range(start..=end)
    }

    pub fn from_range(range: RangeInclusive<u16>) -> Self {
        let cursor = *range.start();
        Self {
            range,
            state: Mutex::new(PoolState {
                cursor,
                ..Default::default()
            }),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    pub fn is_bound(&self, protocol: Protocol, port: u16) -> bool {
        self.lock().used(protocol).contains(&port)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section leaves the sets consistent, so a poisoned
        // lock still guards valid state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_after(&self, port: u16) -> u16 {
        if port >= *self.range.end() {
            *self.range.start()
        } else {
            port + 1
        }
    }
}

impl PortAllocator for PortPool {
    fn bind(&self, protocol: Protocol, preferred: Option<u16>) -> Result<u16, PortError> {
        let mut state = self.lock();

        if let Some(port) = preferred {
            if !self.range.contains(&port) {
                return Err(PortError(PortFailure::OutOfRange(port)));
            }
            if !state.used(protocol).insert(port) {
                return Err(PortError(PortFailure::Collision(port)));
            }
            debug!("Bound preferred host port {}/{}", port, protocol);
            return Ok(port);
        }

        if self.range.is_empty() {
            return Err(PortError(PortFailure::Exhausted));
        }
        let size = usize::from(*self.range.end() - *self.range.start()) + 1;
        let mut candidate = state.cursor;
        for _ in 0..size {
            if state.used(protocol).insert(candidate) {
                state.cursor = self.next_after(candidate);
                debug!("Bound host port {}/{}", candidate, protocol);
                return Ok(candidate);
            }
            candidate = self.next_after(candidate);
        }

        Err(PortError(PortFailure::Exhausted))
    }

    fn release(&self, protocol: Protocol, port: u16) {
        if self.lock().used(protocol).remove(&port) {
            debug!("Released host port {}/{}", port, protocol);
        }
    }

    fn in_use(&self) -> usize {
        let state = self.lock();
        state.tcp.len() + state.udp.len()
    }
}
