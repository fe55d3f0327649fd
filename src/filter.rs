//! Pre-delivery message filters.
//!
//! A filter returning `true` suppresses the message: on the receive side it
//! is dropped before any listener sees it, on the send side the destination
//! is skipped. Suppression is policy, not failure, so it is never reported
//! to the error listener.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{panic_message, MessagingError, Result};

/// Enable/disable-able predicate over (topic, payload type name).
pub trait MessageFilter: Send + Sync {
    /// Returns true when the message must be dropped.
    fn filter(&self, topic: &str, type_name: &str) -> bool;

    fn is_enabled(&self) -> bool;

    fn enable(&self);

    fn disable(&self);
}

type Predicate = dyn Fn(&str, &str) -> bool + Send + Sync;

/// Closure-backed filter, enabled on creation.
pub struct PredicateFilter {
    predicate: Box<Predicate>,
    enabled: AtomicBool,
}

impl PredicateFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            enabled: AtomicBool::new(true),
        }
    }

    /// Drops everything addressed to `topic`.
    pub fn topic(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self::new(move |t, _| t == topic)
    }

    /// Drops every payload of the given type name.
    pub fn type_name(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self::new(move |_, ty| ty == type_name)
    }
}

impl MessageFilter for PredicateFilter {
    fn filter(&self, topic: &str, type_name: &str) -> bool {
        (self.predicate)(topic, type_name)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

impl fmt::Debug for PredicateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateFilter")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Ordered set of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.push(filter);
        self
    }

    /// Append a filter; the same instance is only kept once.
    pub fn push(&mut self, filter: Arc<dyn MessageFilter>) {
        if !self.filters.iter().any(|f| Arc::ptr_eq(f, &filter)) {
            self.filters.push(filter);
        }
    }

    pub fn extend(&mut self, other: &FilterChain) {
        for filter in &other.filters {
            self.push(Arc::clone(filter));
        }
    }

    /// First enabled filter that matches, if any.
    pub fn first_match(&self, topic: &str, type_name: &str) -> Option<&Arc<dyn MessageFilter>> {
        self.filters
            .iter()
            .find(|f| f.is_enabled() && f.filter(topic, type_name))
    }

    pub fn blocks(&self, topic: &str, type_name: &str) -> bool {
        self.first_match(topic, type_name).is_some()
    }

    /// Like [`blocks`](Self::blocks), but a panicking filter becomes an error.
    pub fn try_blocks(&self, topic: &str, type_name: &str) -> Result<bool> {
        catch_unwind(AssertUnwindSafe(|| self.blocks(topic, type_name))).map_err(|panic| {
            MessagingError::FilterFailed {
                topic: topic.to_string(),
                type_name: type_name.to_string(),
                message: panic_message(panic.as_ref()),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

impl FromIterator<Arc<dyn MessageFilter>> for FilterChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn MessageFilter>>>(iter: I) -> Self {
        let mut chain = FilterChain::new();
        for filter in iter {
            chain.push(filter);
        }
        chain
    }
}
