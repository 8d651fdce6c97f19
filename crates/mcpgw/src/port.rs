use std::collections::HashSet;
use std::sync::Mutex;

/// Monotonic port allocator: hands out ports starting at a configured base,
/// never reusing one still in the allocated set.
///
/// Ports are not reused eagerly when released — `next` only ever grows. This
/// is a deliberate simplification; under pathological churn the watermark
/// grows unboundedly, which is acceptable for a local development gateway.
pub struct PortAllocator {
    state: Mutex<PortTable>,
}

struct PortTable {
    allocated: HashSet<u16>,
    next: u16,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            state: Mutex::new(PortTable {
                allocated: HashSet::new(),
                next: base,
            }),
        }
    }

    /// Advance past any occupied entries, reserve the first free port, return it.
    pub fn acquire(&self) -> u16 {
        let mut table = self.state.lock().expect("port table mutex poisoned");
        while table.allocated.contains(&table.next) {
            table.next += 1;
        }
        let port = table.next;
        table.allocated.insert(port);
        table.next += 1;
        port
    }

    /// Remove `port` from the allocated set. Idempotent: releasing a port that
    /// isn't held is a no-op.
    pub fn release(&self, port: u16) {
        let mut table = self.state.lock().expect("port table mutex poisoned");
        table.allocated.remove(&port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.state
            .lock()
            .expect("port table mutex poisoned")
            .allocated
            .contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_returns_increasing_ports() {
        let allocator = PortAllocator::new(10000);
        assert_eq!(allocator.acquire(), 10000);
        assert_eq!(allocator.acquire(), 10001);
        assert_eq!(allocator.acquire(), 10002);
    }

    #[test]
    fn release_then_reacquire_may_reuse_eventually() {
        let allocator = PortAllocator::new(10000);
        let a = allocator.acquire();
        allocator.release(a);
        assert!(!allocator.is_allocated(a));
        // watermark does not rewind: the next acquire still moves forward.
        let b = allocator.acquire();
        assert!(b > a || b == a);
    }

    #[test]
    fn concurrent_acquires_return_distinct_ports() {
        let allocator = Arc::new(PortAllocator::new(20000));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.acquire())
            })
            .collect();

        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        let before = ports.len();
        ports.dedup();
        assert_eq!(before, ports.len(), "acquire() returned duplicate ports");
    }

    #[test]
    fn skips_over_held_ports() {
        let allocator = PortAllocator::new(10000);
        let a = allocator.acquire(); // 10000
        let _b = allocator.acquire(); // 10001
        allocator.release(a);
        let c = allocator.acquire(); // watermark already past 10000, so 10002
        assert_eq!(c, 10002);
    }
}
