//! Cancellation epochs for the long-poll chain.
//!
//! Every request carries the [`Generation`] it was issued under. Advancing
//! the counter kills every older token at once, so a response that was
//! already on the wire when the loop restarted is recognised as stale no
//! matter where it is when it lands.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub struct Generations {
    current: Arc<AtomicU64>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Generation {
        Generation {
            id: self.current.load(Ordering::SeqCst),
            current: Arc::clone(&self.current),
        }
    }

    /// Retire the current generation and mint its successor.
    pub fn advance(&self) -> Generation {
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        Generation {
            id,
            current: Arc::clone(&self.current),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    id: u64,
    current: Arc<AtomicU64>,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.id
    }
}

impl PartialEq for Generation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.current, &other.current)
    }
}

impl Eq for Generation {}
