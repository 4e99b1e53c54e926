//! Node-local port leasing.
//!
//! Tasks request ports through the [`PortLeaser`] trait while expanding their
//! command line and hand them back when they terminate. The pool is shared by
//! every task on the node, so lease and release are serialized on one lock.

use std::collections::{BTreeSet, HashSet};
use std::net::TcpListener;
use std::ops::RangeInclusive;

use parking_lot::Mutex;

use crate::error::PortLeaseError;

/// Issues and reclaims port leases.
pub trait PortLeaser: Send + Sync {
    /// Lease a port. Fails with [`PortLeaseError::Exhausted`] when nothing is left.
    fn lease(&self) -> Result<u16, PortLeaseError>;

    /// Return a port. Releasing a port that is not leased is a no-op.
    fn release(&self, port: u16);
}

/// Lowest-available-first pool over a contiguous port range.
#[derive(Debug)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    probe: bool,
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    available: BTreeSet<u16>,
    leased: HashSet<u16>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                available: range.clone().collect(),
                leased: HashSet::new(),
            }),
            range,
            probe: false,
        }
    }

    /// When enabled, a candidate port that cannot be bound locally is skipped
    /// (left in the pool) and the next one is tried.
    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Number of ports currently free.
    pub fn available(&self) -> usize {
        self.inner.lock().available.len()
    }

    /// Number of ports currently leased.
    pub fn leased(&self) -> usize {
        self.inner.lock().leased.len()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.inner.lock().leased.contains(&port)
    }

    fn bindable(port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

impl PortLeaser for PortPool {
    fn lease(&self) -> Result<u16, PortLeaseError> {
        let mut inner = self.inner.lock();
        let port = if self.probe {
            inner
                .available
                .iter()
                .copied()
                .find(|port| Self::bindable(*port))
        } else {
            inner.available.first().copied()
        };

        let Some(port) = port else {
            tracing::warn!(
                available = inner.available.len(),
                leased = inner.leased.len(),
                "Port pool exhausted"
            );
            return Err(PortLeaseError::Exhausted);
        };

        inner.available.remove(&port);
        inner.leased.insert(port);
        tracing::debug!(port, "Port leased");
        Ok(port)
    }

    fn release(&self, port: u16) {
        let mut inner = self.inner.lock();
        if inner.leased.remove(&port) {
            inner.available.insert(port);
            tracing::debug!(port, "Port released");
        } else {
            tracing::debug!(port, "Ignoring release of port that is not leased");
        }
    }
}
