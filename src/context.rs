//! Two-layer pooled request context.
//!
//! A [`RequestContext`] (outer layer) carries per-request scratch state and
//! owns a [`FeatureSet`] (inner layer) of typed, per-request extensions. The
//! layers live in separate pools, so either one can be retired while the
//! other is reset and reused.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::pool::{ObjectPool, Reset};

/// Typed per-request extensions, keyed by type.
#[derive(Default)]
pub struct FeatureSet {
    features: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSet")
            .field("len", &self.features.len())
            .finish()
    }
}

impl FeatureSet {
    /// Insert a feature, returning the previous one of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, feature: T) -> Option<T> {
        self.features
            .insert(TypeId::of::<T>(), Box::new(feature))
            .and_then(|old| old.downcast().ok().map(|b| *b))
    }

    /// Get a feature by type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.features
            .get(&TypeId::of::<T>())
            .and_then(|f| f.downcast_ref())
    }

    /// Get a feature by type, mutably.
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.features
            .get_mut(&TypeId::of::<T>())
            .and_then(|f| f.downcast_mut())
    }

    /// Remove a feature by type.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.features
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast().ok().map(|b| *b))
    }

    /// Number of features set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Check if no feature is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl Reset for FeatureSet {
    fn reset(&mut self) {
        self.features.clear();
    }
}

/// Per-request working state.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Identifier assigned by the request pipeline
    pub request_id: Option<u64>,
    /// Free-form string items
    pub items: HashMap<String, String>,
    /// Scratch buffer for building responses or log lines
    pub scratch: String,
    features: Option<FeatureSet>,
}

impl RequestContext {
    /// The attached feature set, if any.
    #[must_use]
    pub const fn features(&self) -> Option<&FeatureSet> {
        self.features.as_ref()
    }

    /// The attached feature set, attaching an empty one if missing.
    pub fn features_mut(&mut self) -> &mut FeatureSet {
        self.features.get_or_insert_with(FeatureSet::default)
    }

    /// Detach the feature set from this context.
    pub fn take_features(&mut self) -> Option<FeatureSet> {
        self.features.take()
    }

    /// Attach a feature set, returning the one it replaces.
    pub fn set_features(&mut self, features: FeatureSet) -> Option<FeatureSet> {
        self.features.replace(features)
    }
}

impl Reset for RequestContext {
    fn reset(&mut self) {
        self.request_id = None;
        self.items.clear();
        self.scratch.clear();
        self.features = None;
    }
}

/// Pools for both context layers.
#[derive(Debug)]
pub struct ContextPool {
    contexts: ObjectPool<RequestContext>,
    features: ObjectPool<FeatureSet>,
}

impl ContextPool {
    /// Create both pools with `capacity` slots each, pre-filled with `prewarm`.
    #[must_use]
    pub fn new(capacity: usize, prewarm: usize) -> Self {
        Self {
            contexts: ObjectPool::with_prewarm(capacity, prewarm, RequestContext::default),
            features: ObjectPool::with_prewarm(capacity, prewarm, FeatureSet::default),
        }
    }

    /// Acquire a context with a feature set attached. Never blocks.
    pub fn acquire(&self) -> RequestContext {
        let mut context = self.contexts.acquire();
        context.features = Some(self.features.acquire());
        context
    }

    /// Release a context and its attached feature set, each to its own pool.
    pub fn release(&self, mut context: RequestContext) {
        if let Some(features) = context.features.take() {
            self.features.release(features);
        }
        self.contexts.release(context);
    }

    /// Drop the outer context but keep its feature set for reuse.
    pub fn retire(&self, mut context: RequestContext) {
        if let Some(features) = context.features.take() {
            self.features.release(features);
        }
    }

    /// Release a feature set detached from its context.
    pub fn release_features(&self, features: FeatureSet) {
        self.features.release(features);
    }

    /// Acquire a context wrapped in a guard that releases it on drop.
    pub fn get(&self) -> PooledContext<'_> {
        PooledContext {
            context: Some(self.acquire()),
            pool: self,
        }
    }

    /// Pooled outer contexts.
    #[must_use]
    pub const fn contexts(&self) -> &ObjectPool<RequestContext> {
        &self.contexts
    }

    /// Pooled feature sets.
    #[must_use]
    pub const fn feature_sets(&self) -> &ObjectPool<FeatureSet> {
        &self.features
    }
}

/// A context borrowed from a [`ContextPool`], released on drop.
#[derive(Debug)]
pub struct PooledContext<'a> {
    context: Option<RequestContext>,
    pool: &'a ContextPool,
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}

impl std::ops::Deref for PooledContext<'_> {
    type Target = RequestContext;

    fn deref(&self) -> &Self::Target {
        self.context
            .as_ref()
            .expect("Context already returned to pool")
    }
}

impl std::ops::DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
            .as_mut()
            .expect("Context already returned to pool")
    }
}
