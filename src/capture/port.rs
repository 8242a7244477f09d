//! Tunnel port leasing
//!
//! Each running capture needs its own local port for `adb forward`. Ports are
//! leased from a fixed range; a lease returns its port to the pool when
//! dropped.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::LaunchError;

#[derive(Debug)]
struct PoolState {
    leased: HashSet<u16>,
    /// Next port to try, so recently released ports are not reused at once
    cursor: u16,
}

/// Pool of tunnel ports
#[derive(Debug, Clone)]
pub struct PortPool {
    range: RangeInclusive<u16>,
    state: Arc<Mutex<PoolState>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let cursor = *range.start();
        Self {
            range,
            state: Arc::new(Mutex::new(PoolState {
                leased: HashSet::new(),
                cursor,
            })),
        }
    }

    /// Lease a port nobody else is listening on
    pub fn lease(&self) -> Result<PortLease, LaunchError> {
        self.lease_with(is_port_free)
    }

    fn lease_with(&self, is_free: impl Fn(u16) -> bool) -> Result<PortLease, LaunchError> {
        let first = *self.range.start();
        let last = *self.range.end();
        let exhausted = LaunchError::PortExhausted { first, last };
        if first > last {
            return Err(exhausted);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let span = u32::from(last - first) + 1;

        for step in 0..span {
            let offset = (u32::from(state.cursor - first) + step) % span;
            // offset < span, so this never exceeds `last`
            let port = first + offset as u16;
            if state.leased.contains(&port) || !is_free(port) {
                continue;
            }

            state.leased.insert(port);
            state.cursor = if port == last { first } else { port + 1 };
            return Ok(PortLease {
                port,
                pool: Arc::clone(&self.state),
            });
        }

        Err(exhausted)
    }

    /// Number of ports currently leased
    pub fn leased(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leased
            .len()
    }
}

fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// An exclusively held tunnel port
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    pool: Arc<Mutex<PoolState>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leased
            .remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_release() {
        let pool = PortPool::new(40000..=40001);

        let a = pool.lease_with(|_| true).unwrap();
        let b = pool.lease_with(|_| true).unwrap();
        assert_ne!(a.port(), b.port());
        assert_eq!(pool.leased(), 2);

        let err = pool.lease_with(|_| true).unwrap_err();
        assert_eq!(
            err,
            LaunchError::PortExhausted {
                first: 40000,
                last: 40001
            }
        );

        drop(a);
        assert_eq!(pool.leased(), 1);
        assert!(pool.lease_with(|_| true).is_ok());
    }

    #[test]
    fn test_skips_ports_in_use() {
        let pool = PortPool::new(40000..=40002);
        let lease = pool.lease_with(|port| port != 40000).unwrap();
        assert_eq!(lease.port(), 40001);
    }

    #[test]
    fn test_rotates_through_range() {
        let pool = PortPool::new(40000..=40002);
        let first = pool.lease_with(|_| true).unwrap().port();
        let second = pool.lease_with(|_| true).unwrap().port();
        assert_eq!(first, 40000);
        assert_eq!(second, 40001);
    }

    #[test]
    fn test_all_ports_bound_elsewhere() {
        let pool = PortPool::new(40000..=40003);
        assert!(matches!(
            pool.lease_with(|_| false),
            Err(LaunchError::PortExhausted { .. })
        ));
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn test_lease_skips_bound_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let pool = PortPool::new(port..=port);
        assert!(pool.lease().is_err());

        drop(listener);
        assert_eq!(pool.lease().unwrap().port(), port);
    }
}
