//! In-flight assignment claims.
//!
//! An id is claimed before any remote call and released when processing ends,
//! whatever the outcome. The pipeline holds a [`ClaimTicket`] for as long as it
//! runs; a claim whose ticket is alive is never taken over, however long it
//! has been queued or crawling. A ticket dropped without a release (the
//! pipeline was aborted) leaves an abandoned claim that can be re-taken once
//! the TTL has passed since its last recorded progress.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::util::short_id;

#[derive(Debug)]
struct Claim {
    generation: u64,
    touched: Instant,
    holder: Weak<()>,
}

impl Claim {
    fn in_flight(&self) -> bool {
        self.holder.strong_count() > 0
    }

    fn expired(&self, ttl: Duration) -> bool {
        !self.in_flight() && self.touched.elapsed() >= ttl
    }
}

/// Proof of ownership of one claim
#[derive(Debug)]
pub struct ClaimTicket {
    id: String,
    generation: u64,
    _holder: Arc<()>,
}

impl ClaimTicket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
pub struct ClaimSet {
    claims: DashMap<String, Claim>,
    next_generation: AtomicU64,
    ttl: Duration,
}

impl ClaimSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            claims: DashMap::new(),
            next_generation: AtomicU64::new(1),
            ttl,
        }
    }

    fn issue(&self, id: &str) -> (Claim, ClaimTicket) {
        let holder = Arc::new(());
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let claim = Claim {
            generation,
            touched: Instant::now(),
            holder: Arc::downgrade(&holder),
        };
        let ticket = ClaimTicket {
            id: id.to_string(),
            generation,
            _holder: holder,
        };
        (claim, ticket)
    }

    /// Atomically claim `id`; `None` if another pipeline holds it
    pub fn try_claim(&self, id: &str) -> Option<ClaimTicket> {
        match self.claims.entry(id.to_string()) {
            Entry::Vacant(slot) => {
                let (claim, ticket) = self.issue(id);
                slot.insert(claim);
                Some(ticket)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.in_flight() {
                    if current.touched.elapsed() >= self.ttl {
                        debug!(
                            "Assignment {} still in flight, no progress for {:?}",
                            short_id(id),
                            current.touched.elapsed()
                        );
                    }
                    return None;
                }
                if !current.expired(self.ttl) {
                    return None;
                }
                warn!(
                    "Abandoned claim on {} expired after {:?}, taking it over",
                    short_id(id),
                    self.ttl
                );
                let (claim, ticket) = self.issue(id);
                slot.insert(claim);
                Some(ticket)
            }
        }
    }

    /// Record progress on a held claim
    pub fn touch(&self, ticket: &ClaimTicket) {
        if let Some(mut claim) = self.claims.get_mut(&ticket.id) {
            if claim.generation == ticket.generation {
                claim.touched = Instant::now();
            }
        }
    }

    /// Remove the claim if `ticket` still owns it
    pub fn release(&self, ticket: &ClaimTicket) -> bool {
        self.claims
            .remove_if(&ticket.id, |_, claim| claim.generation == ticket.generation)
            .is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.claims
            .get(id)
            .map(|claim| !claim.expired(self.ttl))
            .unwrap_or(false)
    }

    /// Drop abandoned claims past their TTL, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, claim| !claim.expired(self.ttl));
        before - self.claims.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.claims.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn clear(&self) {
        self.claims.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let claims = ClaimSet::new(Duration::from_secs(600));
        let a1 = claims.try_claim("a1").unwrap();
        assert!(claims.try_claim("a1").is_none());
        assert!(claims.contains("a1"));
        let _a2 = claims.try_claim("a2").unwrap();
        assert_eq!(claims.len(), 2);

        assert!(claims.release(&a1));
        assert!(!claims.release(&a1));
        assert!(claims.try_claim("a1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_claim_survives_ttl() {
        let claims = ClaimSet::new(Duration::from_secs(60));
        let ticket = claims.try_claim("a1").unwrap();

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(claims.contains("a1"));
        assert!(claims.try_claim("a1").is_none());
        assert_eq!(claims.evict_expired(), 0);

        assert!(claims.release(&ticket));
        assert!(claims.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_claim_expires_from_last_progress() {
        let claims = ClaimSet::new(Duration::from_secs(60));
        let ticket = claims.try_claim("a1").unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        claims.touch(&ticket);
        drop(ticket);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(claims.try_claim("a1").is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!claims.contains("a1"));
        let retaken = claims.try_claim("a1").unwrap();
        assert!(claims.contains("a1"));
        assert_eq!(retaken.id(), "a1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_ticket_cannot_release_new_owner() {
        let claims = ClaimSet::new(Duration::from_secs(10));
        let first = claims.try_claim("a1").unwrap();
        let stale = ClaimTicket {
            id: first.id.clone(),
            generation: first.generation,
            _holder: Arc::new(()),
        };
        drop(first);

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = claims.try_claim("a1").unwrap();

        assert!(!claims.release(&stale));
        assert!(claims.contains("a1"));
        claims.touch(&stale);
        assert!(claims.release(&second));
        assert!(claims.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let claims = ClaimSet::new(Duration::from_secs(10));
        drop(claims.try_claim("old"));
        let _held = claims.try_claim("held").unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        drop(claims.try_claim("new"));

        assert_eq!(claims.evict_expired(), 1);
        let mut ids = claims.ids();
        ids.sort();
        assert_eq!(ids, vec!["held".to_string(), "new".to_string()]);

        claims.clear();
        assert!(claims.is_empty());
    }
}
