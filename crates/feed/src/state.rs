//! FeedState: the ordered, id-deduplicated item store behind one feed.
//!
//! Pure data; no I/O. Optimistic changes are two-phase: an item is inserted as
//! `PendingLocal` or hidden as `PendingRemoval`, then either confirmed by a
//! server event or rolled back.

use crate::item::{ConnectionStatus, FeedItem, ItemId, ItemStatus};
use crate::kind::Placement;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Outcome of merging one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Merge {
    pub changed: bool,
    /// Visible count strictly increased.
    pub arrived: bool,
}

#[derive(Debug, Clone)]
pub struct FeedState<P> {
    items: Vec<FeedItem<P>>,
    placement: Placement,
    /// When each optimistic change was applied.
    pending_since: HashMap<ItemId, Instant>,
    pub connection_status: ConnectionStatus,
    pub loading: bool,
}

impl<P: Clone + Serialize + DeserializeOwned> FeedState<P> {
    pub fn new(placement: Placement) -> Self {
        Self {
            items: Vec::new(),
            placement,
            pending_since: HashMap::new(),
            connection_status: ConnectionStatus::Disconnected,
            loading: false,
        }
    }

    /// Visible items, in display order.
    pub fn visible(&self) -> impl Iterator<Item = &FeedItem<P>> {
        self.items.iter().filter(|i| i.is_visible())
    }

    pub fn visible_len(&self) -> usize {
        self.visible().count()
    }

    /// Every retained item, hidden ones included.
    pub fn items(&self) -> &[FeedItem<P>] {
        &self.items
    }

    pub fn get(&self, id: &ItemId) -> Option<&FeedItem<P>> {
        self.items.iter().find(|i| &i.id == id)
    }

    fn position(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|i| &i.id == id)
    }

    /// Replace everything with a snapshot. Later duplicates of an id are dropped.
    ///
    /// In-flight optimistic changes survive: an item pending removal stays hidden
    /// while the snapshot still carries it, and a local insert stays in place until
    /// the snapshot holds its server copy (same id, or `is_echo(local, stored)`).
    pub fn replace_all(
        &mut self,
        snapshot: Vec<FeedItem<P>>,
        is_echo: impl Fn(&P, &P) -> bool,
    ) -> Merge {
        let before = self.visible_len();
        let previous = std::mem::take(&mut self.items);
        let mut pending = std::mem::take(&mut self.pending_since);
        for mut item in snapshot {
            if self.position(&item.id).is_some() {
                tracing::debug!(id = %item.id, "duplicate id in snapshot skipped");
                continue;
            }
            let removing = previous
                .iter()
                .any(|p| p.id == item.id && p.status == ItemStatus::PendingRemoval);
            if removing {
                if let Some(since) = pending.remove(&item.id) {
                    item.status = ItemStatus::PendingRemoval;
                    self.pending_since.insert(item.id.clone(), since);
                }
            }
            self.items.push(item);
        }
        let mut locals: Vec<FeedItem<P>> = previous
            .into_iter()
            .filter(|p| {
                p.status == ItemStatus::PendingLocal
                    && !self
                        .items
                        .iter()
                        .any(|s| s.id == p.id || is_echo(&p.payload, &s.payload))
            })
            .collect();
        if self.placement == Placement::Prepend {
            locals.reverse();
        }
        for local in locals {
            if let Some(since) = pending.remove(&local.id) {
                self.pending_since.insert(local.id.clone(), since);
            }
            self.place(local);
        }
        Merge {
            changed: true,
            arrived: self.visible_len() > before,
        }
    }

    fn place(&mut self, item: FeedItem<P>) {
        match self.placement {
            Placement::Prepend => self.items.insert(0, item),
            Placement::Append => self.items.push(item),
        }
    }

    /// Oldest local insert whose payload `matches`.
    pub fn pending_local_match(&self, matches: impl Fn(&P) -> bool) -> Option<ItemId> {
        let mut locals = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::PendingLocal && matches(&i.payload));
        let oldest = match self.placement {
            Placement::Append => locals.next(),
            Placement::Prepend => locals.last(),
        };
        oldest.map(|i| i.id.clone())
    }

    /// Replace the local insert `local` with its server copy, keeping position.
    pub fn adopt(&mut self, local: &ItemId, mut stored: FeedItem<P>) -> Merge {
        let Some(idx) = self.position(local) else {
            return self.add(stored);
        };
        self.pending_since.remove(local);
        stored.status = ItemStatus::Confirmed;
        self.items[idx] = stored;
        Merge {
            changed: true,
            arrived: false,
        }
    }

    /// Add an item; an existing id is reconciled in place instead of duplicated.
    pub fn add(&mut self, item: FeedItem<P>) -> Merge {
        let before = self.visible_len();
        match self.position(&item.id) {
            Some(idx) => {
                let existing = &mut self.items[idx];
                existing.payload = item.payload;
                if existing.created_at.is_none() {
                    existing.created_at = item.created_at;
                }
                if existing.status == ItemStatus::PendingLocal {
                    existing.status = ItemStatus::Confirmed;
                    self.pending_since.remove(&item.id);
                }
            }
            None => self.place(item),
        }
        Merge {
            changed: true,
            arrived: self.visible_len() > before,
        }
    }

    /// Merge `patch` (a JSON object of fields) into the payload, keeping position.
    pub fn update(&mut self, id: &ItemId, patch: &Value) -> Result<Merge, serde_json::Error> {
        let Some(idx) = self.position(id) else {
            tracing::debug!(%id, "update for unknown item ignored");
            return Ok(Merge::default());
        };
        let item = &mut self.items[idx];
        if let Value::Object(fields) = patch {
            if !fields.is_empty() {
                let mut current = serde_json::to_value(&item.payload)?;
                if let Value::Object(map) = &mut current {
                    for (k, v) in fields {
                        map.insert(k.clone(), v.clone());
                    }
                }
                item.payload = serde_json::from_value(current)?;
            }
        }
        if item.status == ItemStatus::PendingLocal {
            item.status = ItemStatus::Confirmed;
            self.pending_since.remove(id);
        }
        Ok(Merge {
            changed: true,
            arrived: false,
        })
    }

    /// Delete by id; absent ids are a no-op.
    pub fn remove(&mut self, id: &ItemId) -> Merge {
        match self.position(id) {
            Some(idx) => {
                self.items.remove(idx);
                self.pending_since.remove(id);
                Merge {
                    changed: true,
                    arrived: false,
                }
            }
            None => Merge::default(),
        }
    }

    /// Insert a locally created item ahead of server confirmation.
    pub fn insert_pending(&mut self, mut item: FeedItem<P>, now: Instant) -> Merge {
        item.status = ItemStatus::PendingLocal;
        let id = item.id.clone();
        if self.position(&id).is_some() {
            return Merge::default();
        }
        let merge = self.add(item);
        self.pending_since.insert(id, now);
        merge
    }

    /// Hide an item until its removal is confirmed or rolled back.
    pub fn mark_pending_removal(&mut self, id: &ItemId, now: Instant) -> bool {
        match self.items.iter_mut().find(|i| &i.id == id) {
            Some(item) if item.status == ItemStatus::Confirmed => {
                item.status = ItemStatus::PendingRemoval;
                self.pending_since.insert(id.clone(), now);
                true
            }
            _ => false,
        }
    }

    /// Undo an optimistic change: a hidden item becomes visible again, a
    /// locally inserted item is dropped. Returns whether anything changed.
    pub fn rollback(&mut self, id: &ItemId) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        self.pending_since.remove(id);
        match self.items[idx].status {
            ItemStatus::PendingRemoval => {
                self.items[idx].status = ItemStatus::Confirmed;
                true
            }
            ItemStatus::PendingLocal => {
                self.items.remove(idx);
                true
            }
            ItemStatus::Confirmed => false,
        }
    }

    /// Roll back every optimistic change older than `timeout`. Returns the affected ids.
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<ItemId> {
        let expired: Vec<ItemId> = self
            .pending_since
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.rollback(id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.pending_since.clear();
    }
}
