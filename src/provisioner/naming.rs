//! Bounded `<prefix><counter>` node naming.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::error::ProvisionError;
use crate::provider::{CloudProvider, live_with_prefix};

/// Number of counter values tried before giving up.
pub const DEFAULT_NAME_CAPACITY: u32 = 200;

/// Hands out node names that no live node currently uses.
///
/// The counter cycles through `0..capacity` and keeps its position between
/// calls, so repeated provisioning cycles spread over the range.
#[derive(Debug)]
pub struct NameAllocator {
    next: AtomicU32,
    capacity: u32,
}

impl Default for NameAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_CAPACITY)
    }
}

impl NameAllocator {
    /// Creates an allocator cycling through `0..capacity`.
    #[must_use]
    pub const fn new(capacity: u32) -> Self {
        Self {
            next: AtomicU32::new(0),
            capacity,
        }
    }

    /// Size of the counter range.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Picks the next free name for `prefix`, listing live nodes once.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Provider`] when listing fails and
    /// [`ProvisionError::NameSpaceExhausted`] when every candidate is taken.
    pub async fn allocate<P: CloudProvider>(
        &self,
        provider: &P,
        prefix: &str,
    ) -> Result<String, ProvisionError> {
        let filter = live_with_prefix(prefix);
        let taken = provider
            .list_nodes(&*filter)
            .await
            .map_err(|err| ProvisionError::provider("list nodes", &err))?
            .into_iter()
            .map(|node| node.name)
            .collect::<HashSet<_>>();

        for _ in 0..self.capacity {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            let counter = raw.checked_rem(self.capacity).unwrap_or(0);
            let candidate = format!("{prefix}{counter}");
            if taken.contains(&candidate) {
                debug!(%candidate, "node name already in use");
                continue;
            }
            return Ok(candidate);
        }
        Err(ProvisionError::NameSpaceExhausted {
            prefix: prefix.to_owned(),
            capacity: self.capacity,
        })
    }
}
