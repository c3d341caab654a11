// Id issuance for VM objects and symbols
//
// Four independent namespaces, each a strictly increasing counter starting at
// 1. Ids are never reused for the lifetime of the issuer.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdNamespace {
    LogicalObject,
    LogicalSymbol,
    PhysicalObject,
    PhysicalSymbol,
}

impl IdNamespace {
    fn slot(self) -> usize {
        match self {
            IdNamespace::LogicalObject => 0,
            IdNamespace::LogicalSymbol => 1,
            IdNamespace::PhysicalObject => 2,
            IdNamespace::PhysicalSymbol => 3,
        }
    }
}

#[derive(Debug)]
pub struct IdIssuer {
    counters: [AtomicI64; 4],
}

impl Default for IdIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl IdIssuer {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(1)),
        }
    }

    pub fn next(&self, ns: IdNamespace) -> i64 {
        self.counters[ns.slot()].fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_are_independent() {
        let ids = IdIssuer::new();
        let a = ids.next(IdNamespace::LogicalObject);
        assert_eq!(ids.next(IdNamespace::PhysicalObject), 1);
        let b = ids.next(IdNamespace::LogicalObject);
        ids.next(IdNamespace::PhysicalObject);
        let c = ids.next(IdNamespace::LogicalObject);
        assert!(a < b && b < c);
        assert_eq!(ids.next(IdNamespace::LogicalSymbol), 1);
    }

    #[test]
    fn test_concurrent_issue_never_repeats() {
        let ids = std::sync::Arc::new(IdIssuer::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ids.next(IdNamespace::PhysicalSymbol))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
