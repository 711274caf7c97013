//! Local TCP port probing.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

/// How long a readiness probe waits for a TCP handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// A port is free when we can bind it on loopback ourselves.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// A port is ready once something accepts connections on it.
pub async fn is_port_ready(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// First free port in `start..=end`, skipping ports in `held` without probing.
pub fn find_free_port(start: u16, end: u16, held: &HashSet<u16>) -> Option<u16> {
    (start..=end).find(|port| !held.contains(port) && is_port_free(*port))
}

/// Wait until `port` accepts connections, polling every `interval`.
pub async fn wait_until_ready(port: u16, deadline: Duration, interval: Duration) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if is_port_ready(port).await {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_bound_port_is_not_free() {
        let (_listener, port) = bound_listener();
        assert!(!is_port_free(port));
    }

    #[test]
    fn test_find_free_port_skips_held_ports() {
        let (_listener, port) = bound_listener();
        let held: HashSet<u16> = HashSet::new();
        // The only candidate is taken by the listener
        assert_eq!(find_free_port(port, port, &held), None);

        let mut held = HashSet::new();
        held.insert(port);
        assert_eq!(find_free_port(port, port, &held), None);
    }

    #[tokio::test]
    async fn test_listening_port_is_ready() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_ready(port).await);
        assert!(wait_until_ready(port, Duration::from_millis(100), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_closed_port_is_not_ready() {
        let port = {
            let (listener, port) = bound_listener();
            drop(listener);
            port
        };
        assert!(!wait_until_ready(port, Duration::from_millis(50), Duration::from_millis(10)).await);
    }
}
