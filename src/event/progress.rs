use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::event::{EventHandlers, EventHandlersBuilder};

/// A node of the progress tree. Each allocation is worth one unit of its
/// parent and is itself split into `allocation_units` units.
pub struct Allocation {
    description: String,
    allocation_units: u64,
    parent: Option<Arc<Allocation>>,
    fraction_of_root: f64,
}

impl Allocation {
    /// Zero units are treated as one so that every allocation can complete.
    pub fn new_root(description: impl Into<String>, allocation_units: u64) -> Arc<Allocation> {
        let allocation_units = allocation_units.max(1);
        Arc::new(Allocation {
            description: description.into(),
            allocation_units,
            parent: None,
            fraction_of_root: 1.0 / allocation_units as f64,
        })
    }

    pub fn new_child(self: &Arc<Self>, description: impl Into<String>, allocation_units: u64) -> Arc<Allocation> {
        let allocation_units = allocation_units.max(1);
        Arc::new(Allocation {
            description: description.into(),
            allocation_units,
            parent: Some(self.clone()),
            fraction_of_root: self.fraction_of_root / allocation_units as f64,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn allocation_units(&self) -> u64 {
        self.allocation_units
    }

    pub fn parent(&self) -> Option<&Arc<Allocation>> {
        self.parent.as_ref()
    }

    /// Fraction of the root that one unit of this allocation represents.
    pub fn fraction_of_root(&self) -> f64 {
        self.fraction_of_root
    }

    fn is_ancestor_of(self: &Arc<Self>, other: &Arc<Allocation>) -> bool {
        let mut current = other.parent.as_ref();
        while let Some(ancestor) = current {
            if Arc::ptr_eq(ancestor, self) {
                return true;
            }
            current = ancestor.parent.as_ref();
        }
        false
    }
}

impl Debug for Allocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("description", &self.description)
            .field("allocation_units", &self.allocation_units)
            .field("parent", &self.parent.as_ref().map(|parent| parent.description.clone()))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub allocation: Arc<Allocation>,
    pub units: u64,
}

struct IndexedRemainingUnits {
    index: u64,
    allocation: Arc<Allocation>,
    remaining_units: AtomicI64,
}

impl IndexedRemainingUnits {
    fn is_unfinished(&self) -> bool {
        self.remaining_units.load(Ordering::SeqCst) != 0
    }
}

/// Allocations are compared by identity.
fn allocation_key(allocation: &Arc<Allocation>) -> usize {
    Arc::as_ptr(allocation) as usize
}

/// Keeps the remaining units of every allocation seen so far and propagates
/// completion to parents. Safe to share between threads.
#[derive(Default)]
pub struct AllocationCompletionTracker {
    completion_map: Mutex<HashMap<usize, Arc<IndexedRemainingUnits>>>,
    next_index: AtomicU64,
}

impl AllocationCompletionTracker {
    pub fn new() -> AllocationCompletionTracker {
        AllocationCompletionTracker::default()
    }

    /// Returns `true` when the tracked state changed, that is when the
    /// allocation was seen for the first time or `units` is non zero.
    ///
    /// # Panics
    ///
    /// When the cumulative units exceed the allocation's budget.
    pub fn update_progress(&self, allocation: &Arc<Allocation>, units: u64) -> bool {
        let (remaining, inserted) = self.get_or_insert(allocation);
        if units != 0 {
            self.update_remaining_units(&remaining, units);
        }
        inserted || units != 0
    }

    fn get_or_insert(&self, allocation: &Arc<Allocation>) -> (Arc<IndexedRemainingUnits>, bool) {
        let mut completion_map = match self.completion_map.lock() {
            Ok(completion_map) => completion_map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut inserted = false;
        let remaining = completion_map
            .entry(allocation_key(allocation))
            .or_insert_with(|| {
                inserted = true;
                Arc::new(IndexedRemainingUnits {
                    index: self.next_index.fetch_add(1, Ordering::SeqCst),
                    allocation: allocation.clone(),
                    remaining_units: AtomicI64::new(allocation.allocation_units as i64),
                })
            })
            .clone();
        (remaining, inserted)
    }

    fn update_remaining_units(&self, remaining: &IndexedRemainingUnits, units: u64) {
        let units = units as i64;
        let new_units = remaining.remaining_units.fetch_sub(units, Ordering::SeqCst) - units;
        if new_units < 0 {
            panic!(
                "Progress exceeds max for '{}': {} more beyond {}",
                remaining.allocation.description,
                -new_units,
                remaining.allocation.allocation_units
            );
        }
        if new_units == 0 {
            if let Some(parent) = &remaining.allocation.parent {
                self.update_progress(parent, 1);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<IndexedRemainingUnits>> {
        let completion_map = match self.completion_map.lock() {
            Ok(completion_map) => completion_map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut entries = completion_map.values().cloned().collect::<Vec<Arc<IndexedRemainingUnits>>>();
        entries.sort_by_key(|entry| entry.index);
        entries
    }

    /// Allocations with units left, in the order they were first seen.
    pub fn unfinished_allocations(&self) -> Vec<Arc<Allocation>> {
        self.snapshot()
            .into_iter()
            .filter(|entry| entry.is_unfinished())
            .map(|entry| entry.allocation.clone())
            .collect()
    }

    /// Unfinished allocations that are not an ancestor of another unfinished one.
    pub fn unfinished_leaf_tasks(&self) -> Vec<String> {
        let unfinished = self.unfinished_allocations();
        unfinished
            .iter()
            .filter(|allocation| !unfinished.iter().any(|other| allocation.is_ancestor_of(other)))
            .map(|allocation| allocation.description.clone())
            .collect()
    }
}

/// Reports progress for one allocation. Emission is clamped to the units left,
/// and whatever is left is emitted on drop.
///
/// A dispatcher belongs to a single worker: hand children to other threads
/// through [`ProgressEventDispatcher::new_child_producer`].
pub struct ProgressEventDispatcher {
    event_handlers: EventHandlers,
    allocation: Arc<Allocation>,
    remaining_allocation_units: u64,
}

impl ProgressEventDispatcher {
    pub fn new_root(event_handlers: &EventHandlers, description: impl Into<String>, allocation_units: u64) -> ProgressEventDispatcher {
        ProgressEventDispatcher::new(event_handlers.clone(), Allocation::new_root(description, allocation_units))
    }

    fn new(event_handlers: EventHandlers, allocation: Arc<Allocation>) -> ProgressEventDispatcher {
        let dispatcher = ProgressEventDispatcher {
            event_handlers,
            remaining_allocation_units: allocation.allocation_units,
            allocation,
        };
        dispatcher.dispatch(0);
        dispatcher
    }

    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }

    pub fn remaining_allocation_units(&self) -> u64 {
        self.remaining_allocation_units
    }

    /// Reserves one unit of this allocation for a child created by the factory.
    pub fn new_child_producer(&mut self) -> ChildProgressEventDispatcherFactory {
        self.decrement_remaining_allocation_units(1);
        ChildProgressEventDispatcherFactory {
            event_handlers: self.event_handlers.clone(),
            parent: self.allocation.clone(),
        }
    }

    pub fn dispatch_progress(&mut self, progress_units: u64) {
        let units_decremented = self.decrement_remaining_allocation_units(progress_units);
        self.dispatch(units_decremented);
    }

    fn decrement_remaining_allocation_units(&mut self, units: u64) -> u64 {
        if self.remaining_allocation_units >= units {
            self.remaining_allocation_units -= units;
            return units;
        }
        let actual_decrement = self.remaining_allocation_units;
        self.remaining_allocation_units = 0;
        actual_decrement
    }

    fn dispatch(&self, units: u64) {
        self.event_handlers.dispatch(ProgressEvent {
            allocation: self.allocation.clone(),
            units,
        });
    }
}

impl Drop for ProgressEventDispatcher {
    fn drop(&mut self) {
        if self.remaining_allocation_units > 0 {
            let remaining = self.remaining_allocation_units;
            self.dispatch_progress(remaining);
        }
    }
}

/// Creates the one child dispatcher its parent reserved a unit for.
pub struct ChildProgressEventDispatcherFactory {
    event_handlers: EventHandlers,
    parent: Arc<Allocation>,
}

impl ChildProgressEventDispatcherFactory {
    pub fn create(self, description: impl Into<String>, allocation_units: u64) -> ProgressEventDispatcher {
        ProgressEventDispatcher::new(self.event_handlers, self.parent.new_child(description, allocation_units))
    }
}

/// Overall progress together with the tasks currently in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub unfinished_leaf_tasks: Vec<String>,
}

/// Accumulates [`ProgressEvent`]s into a 0 to 1 completion figure.
pub struct ProgressEventHandler {
    completion_tracker: AllocationCompletionTracker,
    progress: Mutex<f64>,
    update_notifier: Box<dyn Fn(ProgressUpdate) + Send + Sync>,
}

impl ProgressEventHandler {
    pub fn new<F>(update_notifier: F) -> ProgressEventHandler
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        ProgressEventHandler {
            completion_tracker: AllocationCompletionTracker::new(),
            progress: Mutex::new(0.0),
            update_notifier: Box::new(update_notifier),
        }
    }

    pub fn accept(&self, progress_event: &ProgressEvent) {
        let allocation = &progress_event.allocation;
        let progress = {
            let mut progress = match self.progress.lock() {
                Ok(progress) => progress,
                Err(poisoned) => poisoned.into_inner(),
            };
            if progress_event.units != 0 {
                *progress += progress_event.units as f64 * allocation.fraction_of_root();
            }
            *progress
        };
        if self.completion_tracker.update_progress(allocation, progress_event.units) {
            (self.update_notifier)(ProgressUpdate {
                progress,
                unfinished_leaf_tasks: self.completion_tracker.unfinished_leaf_tasks(),
            });
        }
    }

    pub fn completion_tracker(&self) -> &AllocationCompletionTracker {
        &self.completion_tracker
    }

    /// Registers this handler for progress events.
    pub fn register(self: Arc<Self>, builder: EventHandlersBuilder) -> EventHandlersBuilder {
        builder.add::<ProgressEvent, _>(move |event| self.accept(event))
    }
}

impl Debug for ProgressEventHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEventHandler").finish()
    }
}
