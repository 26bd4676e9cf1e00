//! Which logged-in identity fetches which account's feed.
//!
//! Private feeds are only visible to the primary account. Public feeds are
//! spread across the alternates to keep the primary's request volume low.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::harvest::source::{Session, TrackedAccount};

/// Picks one of `candidates` alternates by index.
pub trait IdentitySelector: Send + Sync {
    /// Must return a value below `candidates`; never called with zero.
    fn select(&self, candidates: usize) -> usize;
}

/// Uniformly random choice.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl IdentitySelector for RandomSelector {
    fn select(&self, candidates: usize) -> usize {
        rand::rng().random_range(0..candidates)
    }
}

/// Cycles through the alternates in order.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl IdentitySelector for RoundRobinSelector {
    fn select(&self, candidates: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % candidates
    }
}

/// Identity selection policy as named in `config.toml`
pub fn selector_from_config(policy: &str) -> Box<dyn IdentitySelector> {
    match policy.to_lowercase().as_str() {
        "round_robin" | "round-robin" => Box::new(RoundRobinSelector::default()),
        _ => Box::new(RandomSelector),
    }
}

/// The primary identity plus any alternates used for public feeds
pub struct IdentityPool {
    primary: Arc<dyn Session>,
    alternates: Vec<Arc<dyn Session>>,
    selector: Box<dyn IdentitySelector>,
}

impl IdentityPool {
    pub fn new(
        primary: Arc<dyn Session>,
        alternates: Vec<Arc<dyn Session>>,
        selector: Box<dyn IdentitySelector>,
    ) -> Self {
        Self {
            primary,
            alternates,
            selector,
        }
    }

    pub fn primary(&self) -> &Arc<dyn Session> {
        &self.primary
    }

    #[cfg(test)]
    pub fn alternates(&self) -> &[Arc<dyn Session>] {
        &self.alternates
    }

    /// The identity that should fetch `account`'s feed. Falls back to the
    /// primary when no alternates are configured.
    pub fn for_account(&self, account: &TrackedAccount) -> &Arc<dyn Session> {
        if account.is_private || self.alternates.is_empty() {
            return &self.primary;
        }

        let index = self.selector.select(self.alternates.len());
        self.alternates
            .get(index)
            .unwrap_or(&self.primary)
    }

    /// Every identity, primary first.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Session>> {
        std::iter::once(&self.primary).chain(self.alternates.iter())
    }
}
