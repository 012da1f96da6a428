use std::sync::atomic::{AtomicU32, Ordering};

/// Base public port handed out to the first registered agent.
const BASE_PORT: u32 = 10000;

/// Hands out monotonically increasing public ports. Never reuses a port once
/// handed out; wraparound past `u16::MAX` is not a concern at this scale.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU32,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(BASE_PORT),
        }
    }

    /// Atomically returns the next free port. Two concurrent callers never
    /// observe the same value.
    pub fn allocate(&self) -> u16 {
        let v = self.next.fetch_add(1, Ordering::Relaxed);
        v as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn allocations_start_at_base() {
        let a = PortAllocator::new();
        assert_eq!(a.allocate(), 10000);
        assert_eq!(a.allocate(), 10001);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let alloc = Arc::new(PortAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let a = alloc.clone();
            handles.push(std::thread::spawn(move || {
                (0..200).map(|_| a.allocate()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for port in h.join().unwrap() {
                assert!(seen.insert(port), "duplicate port {port}");
            }
        }
        assert_eq!(seen.len(), 8 * 200);
    }
}
