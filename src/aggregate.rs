//! Grouping CVS revisions into changesets (the future SVN commits).
//!
//! Revisions stream in by timestamp. A revision joins an open changeset with
//! the same metadata unless it depends on that changeset through `prev`
//! links, in which case a second changeset with the same metadata is opened.
//! Changesets move open -> expired -> ready -> emitted, so that a changeset
//! is never emitted before one it depends on.

use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::changeset::Changeset;
use crate::changeset::ChangesetKind;
use crate::model::ChangesetId;
use crate::model::CvsItem;
use crate::model::CvsRevision;
use crate::model::ItemId;
use crate::model::MetadataId;
use crate::model::SymbolId;
use crate::model::SymbolType;

/// Two commits by the same author with the same log merge only if their
/// timestamps lie within this many seconds.
pub const COMMIT_THRESHOLD: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Expired,
    Ready,
}

#[derive(Debug)]
struct PendingChangeset {
    id: ChangesetId,
    metadata: MetadataId,
    items: Vec<ItemId>,
    t_min: i64,
    t_max: i64,
    /// Direct dependencies, possibly already emitted.
    deps: BTreeSet<ChangesetId>,
    state: State,
}

#[derive(Debug, Default)]
pub struct ChangesetBuilder {
    next_id: u32,
    pending: HashMap<ChangesetId, PendingChangeset>,
    /// Open changesets per metadata, in creation order.
    open: HashMap<MetadataId, Vec<ChangesetId>>,
    /// Ready changesets in emission order: (t_max, t_min, metadata, id).
    ready: BTreeSet<(i64, i64, MetadataId, ChangesetId)>,
    item_to_changeset: HashMap<ItemId, ChangesetId>,
    emitted_t_max: HashMap<ChangesetId, i64>,
    emitted: Vec<Changeset>,
}

impl ChangesetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one revision; the stream must be sorted by (timestamp, id).
    pub fn add_revision(&mut self, rev: &CvsRevision) {
        self.advance(rev.timestamp);

        let dep = rev.prev.and_then(|p| self.item_to_changeset.get(&p)).copied();
        let forbidden = match dep {
            Some(d) => self.transitive_deps(d),
            None => BTreeSet::new(),
        };

        let candidate = self
            .open
            .get(&rev.metadata)
            .and_then(|ids| ids.iter().copied().find(|id| !forbidden.contains(id)));

        match candidate {
            Some(id) => {
                let changeset = self.pending.get_mut(&id).unwrap();
                changeset.items.push(rev.id);
                changeset.t_max = rev.timestamp;
                changeset.deps.extend(dep);
                self.item_to_changeset.insert(rev.id, id);
            }
            None => {
                let id = ChangesetId(self.next_id);
                self.next_id += 1;
                self.pending.insert(
                    id,
                    PendingChangeset {
                        id,
                        metadata: rev.metadata,
                        items: vec![rev.id],
                        t_min: rev.timestamp,
                        t_max: rev.timestamp,
                        deps: dep.into_iter().collect(),
                        state: State::Open,
                    },
                );
                self.open.entry(rev.metadata).or_default().push(id);
                self.item_to_changeset.insert(rev.id, id);
            }
        }
    }

    /// Flush everything left pending and return the changesets in emission
    /// order.
    pub fn finish(mut self) -> Vec<Changeset> {
        self.advance(i64::MAX);
        debug_assert!(self.pending.is_empty());
        self.emitted
    }

    /// All pending changesets the given one depends on, itself included.
    fn transitive_deps(&self, start: ChangesetId) -> BTreeSet<ChangesetId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(changeset) = self.pending.get(&id) {
                stack.extend(changeset.deps.iter().copied());
            }
        }
        seen
    }

    fn advance(&mut self, now: i64) {
        self.expire(now);
        self.promote();
        self.emit(now);
    }

    /// Close the time window of open changesets the stream has moved past.
    fn expire(&mut self, now: i64) {
        let mut expired = Vec::new();
        for ids in self.open.values_mut() {
            ids.retain(|id| {
                let changeset = &self.pending[id];
                if now != i64::MAX && changeset.t_max + COMMIT_THRESHOLD >= now {
                    return true;
                }
                expired.push(*id);
                false
            });
        }
        self.open.retain(|_, ids| !ids.is_empty());
        for id in expired {
            self.pending.get_mut(&id).unwrap().state = State::Expired;
        }
    }

    /// Move expired changesets whose dependencies are all resolved into the
    /// ready queue, nudging their effective time past their dependencies'.
    fn promote(&mut self) {
        loop {
            let promotable: Vec<ChangesetId> = self
                .pending
                .values()
                .filter(|c| c.state == State::Expired)
                .filter(|c| {
                    c.deps.iter().all(|d| match self.pending.get(d) {
                        Some(dep) => dep.state == State::Ready,
                        None => true,
                    })
                })
                .map(|c| c.id)
                .collect();
            if promotable.is_empty() {
                return;
            }
            for id in promotable {
                let dep_t_max = self.pending[&id]
                    .deps
                    .iter()
                    .filter_map(|d| {
                        self.pending
                            .get(d)
                            .map(|dep| dep.t_max)
                            .or_else(|| self.emitted_t_max.get(d).copied())
                    })
                    .max();
                let changeset = self.pending.get_mut(&id).unwrap();
                if let Some(dep_t_max) = dep_t_max {
                    changeset.t_max = changeset.t_max.max(dep_t_max + 1);
                }
                changeset.state = State::Ready;
                self.ready.insert((changeset.t_max, changeset.t_min, changeset.metadata, id));
            }
        }
    }

    fn emit(&mut self, now: i64) {
        while let Some(&(t_max, _, _, id)) = self.ready.iter().next() {
            if t_max >= now {
                return;
            }
            self.ready.pop_first();
            let pending = self.pending.remove(&id).unwrap();
            for item in &pending.items {
                self.item_to_changeset.remove(item);
            }
            self.emitted_t_max.insert(id, pending.t_max);
            self.emitted.push(Changeset {
                id: pending.id,
                kind: ChangesetKind::Revision,
                items: pending.items,
                t_min: pending.t_min,
                t_max: pending.t_max,
                metadata: Some(pending.metadata),
            });
        }
    }
}

/// Build one changeset per non-excluded symbol, holding all of its per-file
/// occurrences. Ids continue after the revision changesets.
pub fn build_symbol_changesets(
    items: &[CvsItem],
    types: &[SymbolType],
    next_id: u32,
) -> Vec<Changeset> {
    let mut by_symbol: HashMap<SymbolId, Vec<&CvsItem>> = HashMap::new();
    for item in items {
        if let Some(symbol) = item.as_symbol() {
            if types[symbol.symbol.index()] != SymbolType::Excluded {
                by_symbol.entry(symbol.symbol).or_default().push(item);
            }
        }
    }

    let mut timestamps: HashMap<ItemId, i64> = HashMap::new();
    for item in items {
        if let Some(rev) = item.as_revision() {
            timestamps.insert(rev.id, rev.timestamp);
        }
    }

    let mut changesets = Vec::new();
    let mut next_id = next_id;
    let mut symbols: Vec<SymbolId> = by_symbol.keys().copied().collect();
    symbols.sort();
    for symbol in symbols {
        let occurrences = &by_symbol[&symbol];
        let kind = match types[symbol.index()] {
            SymbolType::Branch => ChangesetKind::Branch(symbol),
            SymbolType::Tag => ChangesetKind::Tag(symbol),
            SymbolType::Excluded => unreachable!("filtered above"),
        };
        let times: Vec<i64> = occurrences
            .iter()
            .filter_map(|i| timestamps.get(&i.as_symbol().unwrap().source))
            .copied()
            .collect();
        let mut item_ids: Vec<ItemId> = occurrences.iter().map(|i| i.id()).collect();
        item_ids.sort();
        changesets.push(Changeset {
            id: ChangesetId(next_id),
            kind,
            items: item_ids,
            t_min: times.iter().copied().min().unwrap_or(0),
            t_max: times.iter().copied().max().unwrap_or(0),
            metadata: None,
        });
        next_id += 1;
    }
    changesets
}
