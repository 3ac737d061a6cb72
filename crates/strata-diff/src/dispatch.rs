//! The change tracker and its subscriber contract.
//!
//! A [`ChangeTracker`] owns a [`ShadowWorld`] baseline for one observed world.
//! Every [`update`](ChangeTracker::update) brings the baseline in line with
//! the world and hands the resulting [`Changes`] to each subscriber in
//! ascending priority order. Subscribers receive a [`DispatchContext`] that
//! gives them the world back mutably. If any of them mutates it, the tracker
//! runs another pass, so subscribers always end up observing a settled state.
//!
//! # State machine
//!
//! ```text
//! Idle -> ComputingDiff -> Dispatching -> (Idle | ComputingDiff)
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, debug_span, trace, warn};

use strata_ecs::component::TypeRegistry;
use strata_ecs::world::World;

use crate::builder::compute_changes;
use crate::classify::classify_chunks;
use crate::config::TrackerConfig;
use crate::diff::{Changes, DiffSummary};
use crate::shadow::ShadowWorld;

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Handle returned by callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriberId(u64);

/// A change subscriber.
pub type ChangeCallback = Arc<dyn Fn(&mut DispatchContext<'_>, &Changes) + Send + Sync>;

/// Receives [`TrackingSignal`]s around every update.
pub type TrackingListener = Box<dyn FnMut(TrackingSignal) + Send>;

/// Brackets one [`ChangeTracker::update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackingSignal {
    Begin,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TrackerState {
    #[default]
    Idle,
    ComputingDiff,
    Dispatching,
}

struct Subscriber {
    id: SubscriberId,
    priority: i32,
    callback: ChangeCallback,
}

/// Registered callbacks. Kept sorted by ascending priority; equal priorities
/// keep registration order.
#[derive(Default)]
pub struct SubscriberList {
    entries: Vec<Subscriber>,
    next_id: u64,
    /// Set by registration, cleared by the next sort.
    dirty: bool,
}

impl SubscriberList {
    pub fn register(&mut self, callback: ChangeCallback, priority: i32) -> SubscriberId {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        self.entries.push(Subscriber {
            id,
            priority,
            callback,
        });
        self.dirty = true;
        id
    }

    /// Returns whether `id` was registered.
    pub fn unregister(&mut self, id: SubscriberId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The callbacks to invoke for one dispatch, in order. Changes to the
    /// list made while dispatching take effect on the next snapshot.
    pub fn snapshot(&mut self) -> Vec<(SubscriberId, ChangeCallback)> {
        if self.dirty {
            self.entries.sort_by_key(|entry| entry.priority);
            self.dirty = false;
        }
        self.entries
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.callback)))
            .collect()
    }
}

impl std::fmt::Debug for SubscriberList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// What a subscriber gets besides the [`Changes`].
pub struct DispatchContext<'a> {
    world: &'a mut World,
    subscribers: &'a mut SubscriberList,
    pass: usize,
}

impl DispatchContext<'_> {
    pub fn world(&self) -> &World {
        &*self.world
    }

    /// Mutating the world makes the tracker run another pass after this
    /// dispatch completes.
    pub fn world_mut(&mut self) -> &mut World {
        &mut *self.world
    }

    pub fn register_change_callback<F>(&mut self, callback: F, priority: i32) -> SubscriberId
    where
        F: Fn(&mut DispatchContext<'_>, &Changes) + Send + Sync + 'static,
    {
        self.subscribers.register(Arc::new(callback), priority)
    }

    pub fn unregister_change_callback(&mut self, id: SubscriberId) -> bool {
        self.subscribers.unregister(id)
    }

    /// 1-based pass number within the current update.
    pub fn pass(&self) -> usize {
        self.pass
    }
}

// ---------------------------------------------------------------------------
// ChangeTracker
// ---------------------------------------------------------------------------

/// Outcome of one [`ChangeTracker::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    /// Diff passes run, including the final one that found nothing to do.
    pub passes: usize,
    /// Individual callback invocations.
    pub dispatches: usize,
    /// One entry per dispatched diff.
    pub summaries: Vec<DiffSummary>,
}

/// Tracks one world against a private baseline.
pub struct ChangeTracker {
    registry: Arc<TypeRegistry>,
    config: TrackerConfig,
    shadow: ShadowWorld,
    subscribers: SubscriberList,
    listeners: Vec<TrackingListener>,
    state: TrackerState,
}

impl ChangeTracker {
    /// A tracker with an empty baseline: the first update reports every
    /// tracked entity as created.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::with_config(registry, TrackerConfig::default())
    }

    pub fn with_config(registry: Arc<TypeRegistry>, config: TrackerConfig) -> Self {
        Self {
            registry,
            config,
            shadow: ShadowWorld::new(),
            subscribers: SubscriberList::default(),
            listeners: Vec::new(),
            state: TrackerState::Idle,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn shadow(&self) -> &ShadowWorld {
        &self.shadow
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a subscriber. Lower priorities run first.
    pub fn register_change_callback<F>(&mut self, callback: F, priority: i32) -> SubscriberId
    where
        F: Fn(&mut DispatchContext<'_>, &Changes) + Send + Sync + 'static,
    {
        let id = self.subscribers.register(Arc::new(callback), priority);
        debug!(?id, priority, "registered change callback");
        id
    }

    pub fn unregister_change_callback(&mut self, id: SubscriberId) -> bool {
        self.subscribers.unregister(id)
    }

    pub fn add_tracking_listener<F>(&mut self, listener: F)
    where
        F: FnMut(TrackingSignal) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Forget the baseline. The next update reports every tracked entity as
    /// created.
    pub fn reset(&mut self) {
        self.shadow.clear();
    }

    /// Diff `world` against the baseline, dispatch, and repeat until the
    /// world stops changing.
    ///
    /// # Panics
    ///
    /// Panics if `world` uses a different type registry than the tracker.
    pub fn update(&mut self, world: &mut World) -> UpdateReport {
        self.check_registry(world);
        self.signal(TrackingSignal::Begin);
        let mut guard = UpdateGuard { tracker: self };
        let report = guard.tracker.run_passes(world);
        drop(guard);
        debug!(passes = report.passes, dispatches = report.dispatches, "update complete");
        report
    }

    fn run_passes(&mut self, world: &mut World) -> UpdateReport {
        let mut report = UpdateReport::default();
        loop {
            report.passes += 1;
            let pass = report.passes;
            let span = debug_span!("tracking_pass", pass);
            let _enter = span.enter();
            if pass == self.config.pass_warning_threshold + 1 {
                warn!(
                    passes = pass,
                    threshold = self.config.pass_warning_threshold,
                    "change tracking has not settled; subscribers keep mutating the world"
                );
            }

            let Some(changes) = self.run_cycle(world) else {
                break;
            };
            if changes.is_empty() {
                trace!("diff is empty");
                break;
            }
            report.summaries.push(changes.summary());

            let version = world.version();
            self.state = TrackerState::Dispatching;
            let snapshot = self.subscribers.snapshot();
            let mut context = DispatchContext {
                world: &mut *world,
                subscribers: &mut self.subscribers,
                pass,
            };
            for (id, callback) in &snapshot {
                trace!(?id, "dispatching");
                callback(&mut context, &changes);
                report.dispatches += 1;
            }
            drop(changes);

            if world.version() == version {
                break;
            }
        }
        report
    }

    /// Run one diff cycle without dispatching. The baseline is synchronized
    /// as in [`update`](Self::update).
    pub fn diff_once(&mut self, world: &mut World) -> Option<Changes> {
        self.check_registry(world);
        let changes = self.run_cycle(world);
        self.state = TrackerState::Idle;
        changes.filter(|changes| !changes.is_empty())
    }

    /// Clear dangling references, classify, diff and synchronize. `None`
    /// when no tracked chunk changed.
    fn run_cycle(&mut self, world: &mut World) -> Option<Changes> {
        self.state = TrackerState::ComputingDiff;
        let parallel = self.config.parallel;
        world.clear_dangling_references(parallel);
        let classification = classify_chunks(world, &self.shadow, parallel);
        if !classification.has_changes() {
            trace!(unchanged = classification.unchanged, "no chunk changed");
            return None;
        }
        let changes = compute_changes(&self.registry, world, &self.shadow, &classification, parallel);
        self.shadow.synchronize(world, &classification);
        Some(changes)
    }

    fn signal(&mut self, signal: TrackingSignal) {
        for listener in &mut self.listeners {
            listener(signal);
        }
    }

    fn check_registry(&self, world: &World) {
        assert!(
            Arc::ptr_eq(&self.registry, world.registry()),
            "tracker and world must share one type registry"
        );
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("shadow_chunks", &self.shadow.chunk_count())
            .field("subscribers", &self.subscribers)
            .finish()
    }
}

/// Ends an update on every exit path, including a panicking subscriber.
struct UpdateGuard<'t> {
    tracker: &'t mut ChangeTracker,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.tracker.state = TrackerState::Idle;
        self.tracker.signal(TrackingSignal::End);
    }
}
