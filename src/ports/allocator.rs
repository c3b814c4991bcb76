// src/ports/allocator.rs

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::errors::{Result, RunbridgeError};

/// Finds free TCP ports and leases them until a release signal settles.
///
/// A leased port is never handed out again while its lease is outstanding,
/// even if nothing is bound to it yet (the runner process usually binds the
/// port some time after we picked it).
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    max_attempts: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(host: IpAddr, max_attempts: u16) -> Self {
        Self {
            host,
            max_attempts: max_attempts.max(1),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Find a free port at or above `preferred` and reserve it until
    /// `release` completes (whatever it resolves to).
    ///
    /// `preferred == 0` lets the OS pick an ephemeral port.
    pub async fn find_available_port<F>(&self, preferred: u16, release: F) -> Result<u16>
    where
        F: Future + Send + 'static,
    {
        let port = self.reserve(preferred)?;

        let reserved = Arc::clone(&self.reserved);
        tokio::spawn(async move {
            let _ = release.await;
            lock(&reserved).remove(&port);
            debug!(port, "port lease released");
        });

        Ok(port)
    }

    /// Whether `port` is currently leased by this allocator.
    pub fn is_reserved(&self, port: u16) -> bool {
        lock(&self.reserved).contains(&port)
    }

    fn reserve(&self, preferred: u16) -> Result<u16> {
        if preferred == 0 {
            return self.reserve_ephemeral();
        }

        let mut reserved = lock(&self.reserved);
        let last = preferred.saturating_add(self.max_attempts - 1);

        for port in preferred..=last {
            if reserved.contains(&port) {
                trace!(port, "port already leased; skipping");
                continue;
            }
            if self.can_bind(port) {
                reserved.insert(port);
                debug!(port, preferred, "port leased");
                return Ok(port);
            }
            trace!(port, "port busy; trying next");
        }

        Err(RunbridgeError::PortAllocation(format!(
            "no free port on {} in range {}-{} ({} attempts)",
            self.host, preferred, last, self.max_attempts
        )))
    }

    fn reserve_ephemeral(&self) -> Result<u16> {
        let mut reserved = lock(&self.reserved);

        for _ in 0..self.max_attempts {
            let listener = TcpListener::bind(SocketAddr::new(self.host, 0))?;
            let port = listener.local_addr()?.port();
            drop(listener);

            if reserved.insert(port) {
                debug!(port, "ephemeral port leased");
                return Ok(port);
            }
        }

        Err(RunbridgeError::PortAllocation(format!(
            "OS kept assigning already leased ports on {} ({} attempts)",
            self.host, self.max_attempts
        )))
    }

    fn can_bind(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(self.host, port)).is_ok()
    }
}

fn lock(set: &Mutex<HashSet<u16>>) -> MutexGuard<'_, HashSet<u16>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn allocator() -> PortAllocator {
        PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50)
    }

    async fn wait_released(alloc: &PortAllocator, port: u16) {
        for _ in 0..100 {
            if !alloc.is_reserved(port) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("port {port} was never released");
    }

    #[tokio::test]
    async fn outstanding_leases_are_never_shared() {
        let alloc = allocator();
        let (_keep_a, rx_a) = oneshot::channel::<()>();
        let (_keep_b, rx_b) = oneshot::channel::<()>();

        let a = alloc.find_available_port(0, rx_a).await.unwrap();
        let b = alloc.find_available_port(a, rx_b).await.unwrap();

        assert_ne!(a, b);
        assert!(alloc.is_reserved(a));
        assert!(alloc.is_reserved(b));
    }

    #[tokio::test]
    async fn released_port_becomes_available_again() {
        let alloc = allocator();
        let (tx, rx) = oneshot::channel::<()>();

        let port = alloc.find_available_port(0, rx).await.unwrap();
        assert!(alloc.is_reserved(port));

        // A dropped sender is a "failed" settlement and releases too.
        drop(tx);
        wait_released(&alloc, port).await;

        let (_keep, rx) = oneshot::channel::<()>();
        let again = alloc.find_available_port(port, rx).await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn bound_ports_are_skipped() {
        let alloc = allocator();
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let (_keep, rx) = oneshot::channel::<()>();
        let port = alloc.find_available_port(busy_port, rx).await.unwrap();
        assert_ne!(port, busy_port);
    }

    #[tokio::test]
    async fn exhausted_range_is_an_allocation_error() {
        let alloc = PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let (_keep, rx) = oneshot::channel::<()>();
        let err = alloc.find_available_port(busy_port, rx).await.unwrap_err();
        assert!(matches!(err, RunbridgeError::PortAllocation(_)), "got {err:?}");
    }
}
