//! Reference-counted table of shared broker resources.
//!
//! Several logical producer or consumer handles for the same key share one
//! physical resource. The registry is the single authority for whether that
//! resource exists:
//!
//! - [`acquire`](ResourceRegistry::acquire) attaches to a live resource, or
//!   creates it by calling the factory exactly once. Concurrent acquires of
//!   the same key queue behind the in-flight creation instead of issuing a
//!   second create, which a broker would reject (duplicate consumer group).
//! - [`release`](ResourceRegistry::release) drops one reference; the last one
//!   runs the teardown exactly once and removes the entry.
//!
//! ## Locking
//!
//! The key map sits behind a short-lived `std` mutex that is never held
//! across an `.await`. Each key owns a slot with an async mutex; create,
//! attach and teardown for that key all run inside it, so they serialize per
//! key while different keys proceed independently. Lock order is always slot
//! then map.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{log_debug, log_info, log_warn, MqError, Result};

/// Lookup key of a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Producer {
        instance_id: String,
        topic: String,
    },
    Consumer {
        instance_id: String,
        topic: String,
        group_id: String,
        tag_expression: String,
    },
}

impl ResourceKey {
    pub fn producer(instance_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::Producer {
            instance_id: instance_id.into(),
            topic: topic.into(),
        }
    }

    pub fn consumer(
        instance_id: impl Into<String>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        tag_expression: impl Into<String>,
    ) -> Self {
        Self::Consumer {
            instance_id: instance_id.into(),
            topic: topic.into(),
            group_id: group_id.into(),
            tag_expression: tag_expression.into(),
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Producer { topic, .. } | Self::Consumer { topic, .. } => topic,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer { instance_id, topic } => {
                write!(f, "producer {instance_id}/{topic}")
            }
            Self::Consumer {
                instance_id,
                topic,
                group_id,
                tag_expression,
            } => write!(f, "consumer {instance_id}/{topic}/{group_id} [{tag_expression}]"),
        }
    }
}

/// Lifecycle of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Creating,
    Active,
    ShuttingDown,
    Closed,
}

/// What the slot currently holds. Guarded by the slot's async mutex.
enum Phase<R> {
    /// No resource yet; whoever locks the slot next creates it.
    Pending,
    Active(R),
    /// Creation failed; queued acquirers report the same failure.
    Failed(String),
    Closed,
}

struct Slot<R> {
    key: ResourceKey,
    phase: tokio::sync::Mutex<Phase<R>>,
    // Mirrors of the guarded phase, readable without the async lock. Only
    // written while `phase` is held.
    ref_count: AtomicUsize,
    state: Mutex<ResourceState>,
}

impl<R> Slot<R> {
    fn new(key: ResourceKey) -> Self {
        Self {
            key,
            phase: tokio::sync::Mutex::new(Phase::Pending),
            ref_count: AtomicUsize::new(0),
            state: Mutex::new(ResourceState::Creating),
        }
    }

    fn state(&self) -> ResourceState {
        *lock_ignore_poison(&self.state)
    }

    fn set_state(&self, state: ResourceState) {
        *lock_ignore_poison(&self.state) = state;
    }
}

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One reference to a shared resource.
///
/// Obtained from [`ResourceRegistry::acquire`] and given back, by value,
/// through [`ResourceRegistry::release`]. Not `Clone`: each handle accounts
/// for exactly one reference.
pub struct ResourceHandle<R> {
    slot: Arc<Slot<R>>,
    resource: R,
}

impl<R> ResourceHandle<R> {
    pub fn key(&self) -> &ResourceKey {
        &self.slot.key
    }

    /// The transport-side identifier of the shared resource.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Current number of live references to the shared resource.
    pub fn ref_count(&self) -> usize {
        self.slot.ref_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ResourceState {
        self.slot.state()
    }
}

impl<R: fmt::Debug> fmt::Debug for ResourceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.slot.key)
            .field("resource", &self.resource)
            .field("ref_count", &self.ref_count())
            .field("state", &self.state())
            .finish()
    }
}

/// Keyed, reference-counted resource table.
///
/// `R` is the transport's identifier for the resource (a producer or
/// consumer id). Purely in memory; rebuilt on process restart.
pub struct ResourceRegistry<R> {
    slots: Mutex<HashMap<ResourceKey, Arc<Slot<R>>>>,
}

impl<R> Default for ResourceRegistry<R> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<R> ResourceRegistry<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the resource for `key`, creating it if needed.
    ///
    /// `factory` runs at most once per call, and only when no live or
    /// in-flight resource exists for `key`. Callers arriving while a creation
    /// is in flight wait for it and share its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::ResourceCreation`] when `factory` fails, both to the
    /// caller that ran it and to every caller queued behind it. The failed
    /// entry is discarded, so a later `acquire` tries again.
    pub async fn acquire<F, Fut>(&self, key: ResourceKey, factory: F) -> Result<ResourceHandle<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        // ---
        let mut factory = Some(factory);

        loop {
            let slot = {
                let mut slots = lock_ignore_poison(&self.slots);
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Slot::new(key.clone())))
                    .clone()
            };

            let mut phase = slot.phase.lock().await;

            match &*phase {
                Phase::Active(resource) => {
                    let resource = resource.clone();
                    let refs = slot.ref_count.fetch_add(1, Ordering::SeqCst) + 1;

                    log_debug!("reusing {key} (refs={refs})");
                    return Ok(ResourceHandle {
                        slot: slot.clone(),
                        resource,
                    });
                }
                Phase::Failed(message) => {
                    return Err(MqError::ResourceCreation {
                        key: key.to_string(),
                        message: message.clone(),
                    });
                }
                Phase::Closed => {
                    // Torn down while we queued; the entry is gone from the
                    // map, so the next pass starts a fresh one.
                    continue;
                }
                Phase::Pending => {}
            }

            let create = factory.take().ok_or_else(|| {
                MqError::InvalidState(format!("{key}: creation attempted twice"))
            })?;

            slot.set_state(ResourceState::Creating);

            match create().await {
                Ok(resource) => {
                    *phase = Phase::Active(resource.clone());
                    slot.ref_count.store(1, Ordering::SeqCst);
                    slot.set_state(ResourceState::Active);
                    drop(phase);

                    log_info!("created {key}");
                    return Ok(ResourceHandle {
                        slot: slot.clone(),
                        resource,
                    });
                }
                Err(err) => {
                    let message = err.into_reason();
                    *phase = Phase::Failed(message.clone());
                    slot.set_state(ResourceState::Closed);
                    self.evict(&slot);
                    drop(phase);

                    log_warn!("failed to create {key}: {message}");
                    return Err(MqError::ResourceCreation {
                        key: key.to_string(),
                        message,
                    });
                }
            }
        }
    }

    /// Give back one reference; the last one runs `teardown`.
    ///
    /// `teardown` receives the resource and runs exactly once per created
    /// resource, with the entry locked, so no acquire for the same key can
    /// attach mid-teardown. Its error is returned as-is; the entry is closed
    /// and removed either way.
    pub async fn release<F, Fut>(&self, handle: ResourceHandle<R>, teardown: F) -> Result<()>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.release_key(handle.key(), teardown).await
    }

    /// Key-based form of [`release`](Self::release).
    ///
    /// Releasing a key that has no live entry is a logged no-op, so a
    /// double shutdown from application code is harmless.
    pub async fn release_key<F, Fut>(&self, key: &ResourceKey, teardown: F) -> Result<()>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // ---
        let slot = {
            let slots = lock_ignore_poison(&self.slots);
            slots.get(key).cloned()
        };

        let Some(slot) = slot else {
            log_warn!("release of unknown {key} ignored");
            return Ok(());
        };

        let mut phase = slot.phase.lock().await;

        let resource = match &*phase {
            Phase::Active(resource) => resource.clone(),
            _ => {
                log_warn!("release of {key} in state {:?} ignored", slot.state());
                return Ok(());
            }
        };

        let remaining = slot.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            log_debug!("released {key} (refs={remaining})");
            return Ok(());
        }

        slot.set_state(ResourceState::ShuttingDown);
        let outcome = teardown(resource).await;

        *phase = Phase::Closed;
        slot.set_state(ResourceState::Closed);
        self.evict(&slot);
        drop(phase);

        match &outcome {
            Ok(()) => log_info!("closed {key}"),
            Err(_err) => log_warn!("closed {key} with teardown error: {_err}"),
        }
        outcome
    }

    /// Number of keys with an entry (any state).
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live reference count for `key`, if it has an active resource.
    pub fn ref_count(&self, key: &ResourceKey) -> Option<usize> {
        let slots = lock_ignore_poison(&self.slots);
        slots
            .get(key)
            .filter(|slot| slot.state() == ResourceState::Active)
            .map(|slot| slot.ref_count.load(Ordering::SeqCst))
    }

    /// Lifecycle state of the entry for `key`, if any.
    pub fn state(&self, key: &ResourceKey) -> Option<ResourceState> {
        let slots = lock_ignore_poison(&self.slots);
        slots.get(key).map(|slot| slot.state())
    }

    // Remove `slot` from the map unless it was already replaced.
    fn evict(&self, slot: &Arc<Slot<R>>) {
        let mut slots = lock_ignore_poison(&self.slots);
        if let Some(current) = slots.get(&slot.key) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(&slot.key);
            }
        }
    }
}
