//! Per-connection client identities.
//!
//! Identities name the network namespace, interfaces and session file of
//! each client. They are handed out by the acceptor only, starting at 0,
//! and are never reused while the process lives.

/// Unique identifier for an accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(u64);

impl ClientIdentity {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Monotonic identity counter owned by the acceptor.
///
/// Allocation takes `&mut self`, so only the owner can hand out identities.
#[derive(Debug, Default)]
pub struct IdentityAllocator {
    next: u64,
}

impl IdentityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next identity.
    pub fn allocate(&mut self) -> ClientIdentity {
        let id = ClientIdentity(self.next);
        self.next += 1;
        id
    }

    /// Number of identities handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_and_increases() {
        let mut ids = IdentityAllocator::new();
        assert_eq!(ids.allocate(), ClientIdentity::new(0));
        assert_eq!(ids.allocate(), ClientIdentity::new(1));
        assert_eq!(ids.allocated(), 2);
    }

    #[test]
    fn burst_allocation_is_unique() {
        let mut ids = IdentityAllocator::new();
        let allocated: Vec<_> = (0..1000).map(|_| ids.allocate()).collect();
        assert!(allocated.windows(2).all(|w| w[0] < w[1]));
        let distinct: std::collections::HashSet<_> = allocated.iter().collect();
        assert_eq!(distinct.len(), 1000);
    }

    #[test]
    fn display_format() {
        assert_eq!(ClientIdentity::new(7).to_string(), "client-7");
    }
}
