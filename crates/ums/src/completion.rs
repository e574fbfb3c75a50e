//! Completion lists: the user-owned candidates a scheduler may dispatch.
//!
//! A list is an ordered sequence of `(worker id, priority)` pairs guarded by
//! its own lock. The engine only ever reads a snapshot of it; readiness
//! queries answer with a new list the caller owns.

use core::fmt;

use parking_lot::Mutex;

use crate::worker::WorkerId;

/// Priority attached to a completion list entry. Higher runs first when a
/// policy uses [`CompletionList::highest_priority`].
pub type Priority = i32;

/// One dispatch candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CompletionItem {
    pub worker: WorkerId,
    pub priority: Priority,
}

impl CompletionItem {
    pub const fn new(worker: WorkerId, priority: Priority) -> Self {
        Self { worker, priority }
    }
}

/// Ordered, append-only list of dispatch candidates.
#[derive(Debug, Default)]
pub struct CompletionList {
    items: Mutex<Vec<CompletionItem>>,
}

impl CompletionList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a list holding `items` in order.
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = CompletionItem>,
    {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Appends a candidate at the tail.
    pub fn add(&self, worker: WorkerId, priority: Priority) {
        self.items.lock().push(CompletionItem::new(worker, priority));
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Snapshot of the entries, in list order.
    pub fn items(&self) -> Vec<CompletionItem> {
        self.items.lock().clone()
    }

    /// Snapshot of the worker ids, in list order.
    pub fn ids(&self) -> Vec<WorkerId> {
        self.items.lock().iter().map(|item| item.worker).collect()
    }

    /// Returns true if `worker` appears in the list.
    pub fn contains(&self, worker: WorkerId) -> bool {
        self.items.lock().iter().any(|item| item.worker == worker)
    }

    /// First entry carrying the highest priority.
    pub fn highest_priority(&self) -> Option<CompletionItem> {
        let items = self.items.lock();
        let mut best: Option<CompletionItem> = None;
        for item in items.iter() {
            match best {
                Some(current) if current.priority >= item.priority => {}
                _ => best = Some(*item),
            }
        }
        best
    }
}

impl Clone for CompletionList {
    fn clone(&self) -> Self {
        Self::from_items(self.items())
    }
}

impl fmt::Display for CompletionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items = self.items.lock();
        writeln!(f, "completion list ({} entries)", items.len())?;
        for (index, item) in items.iter().enumerate() {
            writeln!(
                f,
                "  [{index}] worker={} prio={}",
                item.worker, item.priority
            )?;
        }
        Ok(())
    }
}
