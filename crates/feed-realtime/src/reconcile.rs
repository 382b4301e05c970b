//! Merge of paged REST fetches with live push events.
//!
//! A [`FeedReconciler`] holds one ordered, duplicate-free list. Items are
//! matched by id; a second copy of a held item is folded into it with
//! [`FeedItem::merge_newer`] instead of being inserted.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use chrono::NaiveDateTime;
use feed_proto::{ChatMessage, FeedPage, MessageId, NotificationId, NotificationRecord};

pub trait FeedItem: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Debug + Send + Sync;

    fn id(&self) -> Self::Id;

    fn timestamp(&self) -> NaiveDateTime;

    /// Folds another copy of the same item into `self`. Status only moves
    /// forward; every other field comes from whichever copy is newer.
    /// Returns true if anything changed.
    fn merge_newer(&mut self, other: Self) -> bool;
}

impl FeedItem for NotificationRecord {
    type Id = NotificationId;

    fn id(&self) -> NotificationId {
        self.id
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    fn merge_newer(&mut self, other: Self) -> bool {
        let before = self.clone();
        let status = self.status.max(other.status);
        if other.timestamp >= self.timestamp {
            *self = other;
        }
        self.status = status;
        *self != before
    }
}

impl FeedItem for ChatMessage {
    type Id = MessageId;

    fn id(&self) -> MessageId {
        self.id.clone()
    }

    fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    fn merge_newer(&mut self, other: Self) -> bool {
        let before = self.clone();
        let status = self.status.max(other.status);
        if other.timestamp >= self.timestamp {
            *self = other;
        }
        self.status = status;
        *self != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOrder {
    /// Live items go on top, older pages below (notifications).
    NewestFirst,
    /// Non-decreasing by timestamp wherever an item came from (chat).
    Chronological,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome<T> {
    Inserted,
    Updated { previous: T },
    Unchanged,
}

/// Per-item outcomes of one page merge, in page order. Each outcome is
/// paired with the held item as it stood right after that item merged, so
/// later duplicates in the same page do not rewrite earlier entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMerge<T> {
    pub outcomes: Vec<(T, MergeOutcome<T>)>,
}

impl<T> PageMerge<T> {
    pub fn inserted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, MergeOutcome::Inserted))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct FeedReconciler<T: FeedItem> {
    order: FeedOrder,
    items: Vec<T>,
    ids: HashSet<T::Id>,
    has_more: bool,
}

impl<T: FeedItem> FeedReconciler<T> {
    pub fn new(order: FeedOrder) -> Self {
        Self {
            order,
            items: Vec::new(),
            ids: HashSet::new(),
            has_more: false,
        }
    }

    pub fn order(&self) -> FeedOrder {
        self.order
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.ids.contains(id)
    }

    pub fn find(&self, id: &T::Id) -> Option<&T> {
        self.position(id).map(|index| &self.items[index])
    }

    /// The item a backwards page cursor starts from.
    pub fn oldest(&self) -> Option<&T> {
        match self.order {
            FeedOrder::NewestFirst => self.items.last(),
            FeedOrder::Chronological => self.items.first(),
        }
    }

    pub fn count_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        self.items.iter().filter(|item| predicate(item)).count()
    }

    /// Drops everything held and starts over from `page`.
    pub fn replace(&mut self, page: FeedPage<T>) {
        self.items.clear();
        self.ids.clear();
        self.has_more = page.has_more;
        for item in page.items {
            self.merge_below(item);
        }
    }

    pub fn merge_live(&mut self, item: T) -> MergeOutcome<T> {
        if self.contains(&item.id()) {
            return self.merge_existing(item);
        }
        self.ids.insert(item.id());
        match self.order {
            FeedOrder::NewestFirst => self.items.insert(0, item),
            FeedOrder::Chronological => self.insert_chronological(item),
        }
        MergeOutcome::Inserted
    }

    /// Merges a page of older items and takes its `has_more`.
    pub fn merge_page(&mut self, page: FeedPage<T>) -> PageMerge<T> {
        self.has_more = page.has_more;
        let outcomes = page
            .items
            .into_iter()
            .map(|item| {
                let id = item.id();
                let incoming = item.clone();
                let outcome = self.merge_below(item);
                let held = self.find(&id).cloned().unwrap_or(incoming);
                (held, outcome)
            })
            .collect();
        PageMerge { outcomes }
    }

    /// Applies `change` to the held item; returns its previous value.
    pub fn update(&mut self, id: &T::Id, change: impl FnOnce(&mut T)) -> Option<T> {
        let index = self.position(id)?;
        let previous = self.items[index].clone();
        change(&mut self.items[index]);
        if self.order == FeedOrder::Chronological
            && self.items[index].timestamp() != previous.timestamp()
        {
            let item = self.items.remove(index);
            self.insert_chronological(item);
        }
        Some(previous)
    }

    pub fn update_all(&mut self, mut change: impl FnMut(&mut T)) {
        for item in &mut self.items {
            change(item);
        }
    }

    pub fn remove(&mut self, id: &T::Id) -> Option<T> {
        let index = self.position(id)?;
        self.ids.remove(id);
        Some(self.items.remove(index))
    }

    fn position(&self, id: &T::Id) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.items.iter().position(|item| &item.id() == id)
    }

    /// Page items land below everything held (newest-first) or at their
    /// timestamp (chronological).
    fn merge_below(&mut self, item: T) -> MergeOutcome<T> {
        if self.contains(&item.id()) {
            return self.merge_existing(item);
        }
        self.ids.insert(item.id());
        match self.order {
            FeedOrder::NewestFirst => self.items.push(item),
            FeedOrder::Chronological => self.insert_chronological(item),
        }
        MergeOutcome::Inserted
    }

    fn merge_existing(&mut self, item: T) -> MergeOutcome<T> {
        let id = item.id();
        let Some(index) = self.position(&id) else {
            return MergeOutcome::Unchanged;
        };
        let previous = self.items[index].clone();
        if !self.items[index].merge_newer(item) {
            return MergeOutcome::Unchanged;
        }
        if self.order == FeedOrder::Chronological
            && self.items[index].timestamp() != previous.timestamp()
        {
            let moved = self.items.remove(index);
            self.insert_chronological(moved);
        }
        MergeOutcome::Updated { previous }
    }

    /// Inserts after every item with an equal or earlier timestamp, so ties
    /// keep arrival order.
    fn insert_chronological(&mut self, item: T) {
        let at = self
            .items
            .partition_point(|held| held.timestamp() <= item.timestamp());
        self.items.insert(at, item);
    }
}
