//! Linearising the changeset graph into the SVN revision order.
//!
//! CVS has no atomic cross-file commits and RCS timestamps skew, so the
//! dependency graph can contain cycles. Revision-only cycles are broken by
//! splitting the largest changeset on the cycle at its median timestamp;
//! cycles through symbol changesets are broken by peeling the offending
//! per-file symbol occurrences into a secondary fill.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use anyhow::bail;
use anyhow::Result;
use itertools::Itertools;

use crate::changeset::Changeset;
use crate::changeset::ChangesetKind;
use crate::model::ChangesetId;
use crate::model::CvsItem;
use crate::model::ItemId;

type Edges = HashMap<ChangesetId, BTreeSet<ChangesetId>>;

pub struct Scheduler<'a> {
    items: &'a [CvsItem],
    changesets: Vec<Changeset>,
    /// Extra edges (secondary fill -> primary fill) created while peeling.
    extra_edges: Vec<(ChangesetId, ChangesetId)>,
    next_id: u32,
}

impl<'a> Scheduler<'a> {
    pub fn new(changesets: Vec<Changeset>, items: &'a [CvsItem]) -> Self {
        let next_id = changesets.iter().map(|c| c.id.0 + 1).max().unwrap_or(0);
        Self { items, changesets, extra_edges: Vec::new(), next_id }
    }

    /// Produce the final changeset order. Dependencies always come earlier.
    pub fn run(mut self) -> Result<Vec<Changeset>> {
        self.break_revision_cycles()?;
        self.break_symbol_cycles()?;
        let edges = self.build_edges(false);
        let order = self.topo_sort(&edges)?;
        log::info!("scheduled {} changeset(s)", order.len());
        Ok(order)
    }

    fn item(&self, id: ItemId) -> &CvsItem {
        &self.items[id.index()]
    }

    /// Dependency edges, changeset -> the changesets it depends on.
    ///
    /// With `revisions_only`, symbol changesets and the edges through them
    /// are left out.
    fn build_edges(&self, revisions_only: bool) -> Edges {
        let included: BTreeSet<ChangesetId> = self
            .changesets
            .iter()
            .filter(|c| !revisions_only || c.is_revision())
            .map(|c| c.id)
            .collect();
        let mut holder: HashMap<ItemId, ChangesetId> = HashMap::new();
        for changeset in &self.changesets {
            for &item in &changeset.items {
                holder.insert(item, changeset.id);
            }
        }
        // The primary fill of a symbol is the first of its changesets;
        // secondaries are only ever appended after it.
        let mut branch_changeset: HashMap<_, ChangesetId> = HashMap::new();
        for changeset in &self.changesets {
            if let ChangesetKind::Branch(symbol) = changeset.kind {
                branch_changeset.entry(symbol).or_insert(changeset.id);
            }
        }

        let mut edges: Edges = included.iter().map(|&id| (id, BTreeSet::new())).collect();
        for changeset in &self.changesets {
            if !included.contains(&changeset.id) {
                continue;
            }
            let mut deps = BTreeSet::new();
            for &item_id in &changeset.items {
                match self.item(item_id) {
                    CvsItem::Revision(rev) => {
                        if let Some(prev) = rev.prev {
                            if let Some(&holder_id) = holder.get(&prev) {
                                deps.insert(holder_id);
                            }
                        }
                        if !revisions_only && rev.first_on_branch {
                            if let Some(branch) = rev.lod.branch_id() {
                                if let Some(&fill) = branch_changeset.get(&branch) {
                                    deps.insert(fill);
                                }
                            }
                        }
                    }
                    CvsItem::Symbol(symbol) => {
                        if let Some(&holder_id) = holder.get(&symbol.source) {
                            deps.insert(holder_id);
                        }
                    }
                }
            }
            deps.remove(&changeset.id);
            deps.retain(|d| included.contains(d));
            *edges.get_mut(&changeset.id).unwrap() = deps;
        }
        for &(from, to) in &self.extra_edges {
            if included.contains(&from) && included.contains(&to) {
                edges.get_mut(&from).unwrap().insert(to);
            }
        }
        edges
    }

    fn break_revision_cycles(&mut self) -> Result<()> {
        loop {
            let edges = self.build_edges(true);
            let cycles = strongly_connected_components(&edges)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .collect_vec();
            if cycles.is_empty() {
                return Ok(());
            }
            log::debug!("breaking {} revision cycle(s)", cycles.len());
            for scc in cycles {
                self.split_largest_revision_changeset(&scc)?;
            }
        }
    }

    fn split_largest_revision_changeset(&mut self, scc: &[ChangesetId]) -> Result<()> {
        let members: BTreeSet<ChangesetId> = scc.iter().copied().collect();
        let index = self
            .changesets
            .iter()
            .positions(|c| members.contains(&c.id))
            .max_by_key(|&i| (self.changesets[i].items.len(), Reverse(self.changesets[i].id)))
            .expect("non-empty component");
        if self.changesets[index].items.len() < 2 {
            bail!("cannot break dependency cycle: every changeset on it is a single revision");
        }

        let changeset = self.changesets.remove(index);
        let mut items = changeset.items;
        items.sort_by_key(|&id| {
            let rev = self.item(id).as_revision().expect("revision changeset");
            (rev.timestamp, rev.id)
        });

        // Split at the timestamp midpoint, falling back to the middle of the
        // list when every revision carries the same time.
        let t_mid = (self.timestamp_of(items[0]) + self.timestamp_of(*items.last().unwrap())) / 2;
        let mut split = items.partition_point(|&id| self.timestamp_of(id) <= t_mid);
        if split == 0 || split == items.len() {
            split = items.len() / 2;
        }
        let late = items.split_off(split);

        log::debug!(
            "split changeset {} into {} + {} item(s)",
            changeset.id,
            items.len(),
            late.len()
        );
        for half in [items, late] {
            let timestamps = half.iter().map(|&id| self.timestamp_of(id)).collect_vec();
            self.changesets.push(Changeset {
                id: ChangesetId(self.next_id),
                kind: ChangesetKind::Revision,
                t_min: timestamps.iter().copied().min().unwrap(),
                t_max: timestamps.iter().copied().max().unwrap(),
                items: half,
                metadata: changeset.metadata,
            });
            self.next_id += 1;
        }
        Ok(())
    }

    fn timestamp_of(&self, id: ItemId) -> i64 {
        self.item(id).as_revision().expect("revision changeset").timestamp
    }

    fn break_symbol_cycles(&mut self) -> Result<()> {
        loop {
            let edges = self.build_edges(false);
            let Some(scc) = strongly_connected_components(&edges)
                .into_iter()
                .find(|scc| scc.len() > 1)
            else {
                return Ok(());
            };

            let members: BTreeSet<ChangesetId> = scc.iter().copied().collect();
            let holder: HashMap<ItemId, ChangesetId> = self
                .changesets
                .iter()
                .flat_map(|c| c.items.iter().map(move |&i| (i, c.id)))
                .collect();

            let Some(index) = self
                .changesets
                .iter()
                .positions(|c| !c.is_revision() && members.contains(&c.id))
                .min_by_key(|&i| self.changesets[i].id)
            else {
                bail!("dependency cycle with no symbol changeset survived revision cycle breaking");
            };

            let primary_id = self.changesets[index].id;
            let kind = self.changesets[index].kind;
            let (peeled, kept): (Vec<ItemId>, Vec<ItemId>) =
                self.changesets[index].items.iter().copied().partition(|&item| {
                    let source = self.item(item).as_symbol().expect("symbol changeset").source;
                    holder.get(&source).is_some_and(|h| members.contains(h))
                });
            if peeled.is_empty() {
                bail!("dependency cycle could not be broken by splitting a symbol changeset");
            }

            log::debug!(
                "peeled {} occurrence(s) of changeset {} into a secondary fill",
                peeled.len(),
                primary_id
            );
            self.changesets[index].items = kept;
            let secondary = Changeset {
                id: ChangesetId(self.next_id),
                kind,
                items: peeled,
                t_min: self.changesets[index].t_min,
                t_max: self.changesets[index].t_max,
                metadata: None,
            };
            self.next_id += 1;
            self.extra_edges.push((secondary.id, primary_id));
            self.changesets.push(secondary);
        }
    }

    /// Kahn's algorithm with a priority queue so ties resolve by
    /// (t_min, id).
    fn topo_sort(&self, edges: &Edges) -> Result<Vec<Changeset>> {
        let by_id: HashMap<ChangesetId, &Changeset> =
            self.changesets.iter().map(|c| (c.id, c)).collect();
        let mut dependents: HashMap<ChangesetId, Vec<ChangesetId>> = HashMap::new();
        let mut pending_deps: HashMap<ChangesetId, usize> = HashMap::new();
        for (&id, deps) in edges {
            pending_deps.insert(id, deps.len());
            for &dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut queue = BinaryHeap::new();
        for (&id, &count) in &pending_deps {
            if count == 0 {
                queue.push(Reverse((by_id[&id].t_min, id)));
            }
        }

        let mut order = Vec::with_capacity(self.changesets.len());
        while let Some(Reverse((_, id))) = queue.pop() {
            order.push((*by_id[&id]).clone());
            for &dependent in dependents.get(&id).into_iter().flatten() {
                let count = pending_deps.get_mut(&dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    queue.push(Reverse((by_id[&dependent].t_min, dependent)));
                }
            }
        }

        if order.len() != self.changesets.len() {
            bail!("changeset graph still contains a cycle after cycle breaking");
        }
        Ok(order)
    }
}

/// Iterative Tarjan; returns every strongly connected component.
fn strongly_connected_components(edges: &Edges) -> Vec<Vec<ChangesetId>> {
    struct Frame {
        node: ChangesetId,
        next: usize,
    }

    let neighbors: HashMap<ChangesetId, Vec<ChangesetId>> = edges
        .iter()
        .map(|(&id, deps)| (id, deps.iter().copied().filter(|d| edges.contains_key(d)).collect()))
        .collect();

    let mut index_of: HashMap<ChangesetId, usize> = HashMap::new();
    let mut low: HashMap<ChangesetId, usize> = HashMap::new();
    let mut on_stack: BTreeSet<ChangesetId> = BTreeSet::new();
    let mut stack: Vec<ChangesetId> = Vec::new();
    let mut components = Vec::new();
    let mut counter = 0;

    let mut roots: Vec<ChangesetId> = edges.keys().copied().collect();
    roots.sort();

    for root in roots {
        if index_of.contains_key(&root) {
            continue;
        }
        let mut frames = vec![Frame { node: root, next: 0 }];
        index_of.insert(root, counter);
        low.insert(root, counter);
        counter += 1;
        stack.push(root);
        on_stack.insert(root);

        while let Some(frame) = frames.last_mut() {
            let node = frame.node;
            if let Some(&next) = neighbors[&node].get(frame.next) {
                frame.next += 1;
                if !index_of.contains_key(&next) {
                    index_of.insert(next, counter);
                    low.insert(next, counter);
                    counter += 1;
                    stack.push(next);
                    on_stack.insert(next);
                    frames.push(Frame { node: next, next: 0 });
                } else if on_stack.contains(&next) {
                    let candidate = index_of[&next];
                    let entry = low.get_mut(&node).unwrap();
                    *entry = (*entry).min(candidate);
                }
            } else {
                frames.pop();
                if let Some(parent) = frames.last() {
                    let child_low = low[&node];
                    let entry = low.get_mut(&parent.node).unwrap();
                    *entry = (*entry).min(child_low);
                }
                if low[&node] == index_of[&node] {
                    let mut component = Vec::new();
                    loop {
                        let member = stack.pop().unwrap();
                        on_stack.remove(&member);
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CvsRevision;
    use crate::model::CvsSymbol;
    use crate::model::FileId;
    use crate::model::Lod;
    use crate::model::MetadataId;
    use crate::model::RevOp;
    use crate::model::SymbolId;

    fn rev(id: u32, file: u32, ts: i64, prev: Option<u32>) -> CvsItem {
        CvsItem::Revision(CvsRevision {
            id: ItemId(id),
            file: FileId(file),
            rev: "1.1".parse().unwrap(),
            timestamp: ts,
            metadata: MetadataId(0),
            op: RevOp::Change,
            prev: prev.map(ItemId),
            next: None,
            lod: Lod::Trunk,
            branches: Vec::new(),
            tags: Vec::new(),
            closed_symbols: Vec::new(),
            default_branch_revision: false,
            deltatext_exists: true,
            first_on_branch: false,
        })
    }

    fn changeset(id: u32, items: &[u32], t: i64) -> Changeset {
        Changeset {
            id: ChangesetId(id),
            kind: ChangesetKind::Revision,
            items: items.iter().map(|&i| ItemId(i)).collect(),
            t_min: t,
            t_max: t,
            metadata: Some(MetadataId(0)),
        }
    }

    fn assert_deps_precede(order: &[Changeset], items: &[CvsItem]) {
        let position: HashMap<ChangesetId, usize> =
            order.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        let holder: HashMap<ItemId, ChangesetId> = order
            .iter()
            .flat_map(|c| c.items.iter().map(move |&i| (i, c.id)))
            .collect();
        for changeset in order {
            for &item in &changeset.items {
                if let Some(rev) = items[item.index()].as_revision() {
                    if let Some(prev) = rev.prev {
                        let dep = holder[&prev];
                        if dep != changeset.id {
                            assert!(
                                position[&dep] < position[&changeset.id],
                                "{} must precede {}",
                                dep,
                                changeset.id
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn orders_acyclic_graph_by_time() {
        let items = vec![rev(0, 0, 100, None), rev(1, 0, 200, Some(0)), rev(2, 1, 50, None)];
        let changesets = vec![
            changeset(0, &[0], 100),
            changeset(1, &[1], 200),
            changeset(2, &[2], 50),
        ];
        let order = Scheduler::new(changesets, &items).run().unwrap();
        let ids: Vec<u32> = order.iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![2, 0, 1]);
    }

    #[test]
    fn breaks_a_two_changeset_cycle() {
        // Changeset 0 holds {a1, b2}; changeset 1 holds {b1, a2} with
        // a1 -> a2 -> a1-style cross dependencies:
        //   a2.prev = a1 (0 depends on ... ) and b2.prev = b1.
        let items = vec![
            rev(0, 0, 100, None),     // a1 in cs0
            rev(1, 1, 110, None),     // b1 in cs1
            rev(2, 0, 120, Some(0)),  // a2 in cs1, depends on cs0
            rev(3, 1, 130, Some(1)),  // b2 in cs0, depends on cs1
        ];
        let changesets = vec![changeset(0, &[0, 3], 100), changeset(1, &[1, 2], 110)];
        let order = Scheduler::new(changesets, &items).run().unwrap();
        assert!(order.len() > 2, "a changeset must have been split");
        assert_eq!(order.iter().map(|c| c.items.len()).sum::<usize>(), 4);
        assert_deps_precede(&order, &items);
    }

    #[test]
    fn symbol_changeset_follows_its_sources() {
        let mut items = vec![rev(0, 0, 100, None), rev(1, 0, 200, Some(0))];
        items.push(CvsItem::Symbol(CvsSymbol {
            id: ItemId(2),
            symbol: SymbolId(0),
            file: FileId(0),
            source: ItemId(1),
        }));
        let changesets = vec![
            changeset(0, &[0], 100),
            changeset(1, &[1], 200),
            Changeset {
                id: ChangesetId(2),
                kind: ChangesetKind::Tag(SymbolId(0)),
                items: vec![ItemId(2)],
                t_min: 200,
                t_max: 200,
                metadata: None,
            },
        ];
        let order = Scheduler::new(changesets, &items).run().unwrap();
        let ids: Vec<u32> = order.iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn first_on_branch_commit_waits_for_the_fill() {
        // f: 1.1 (trunk, sprouts B), 1.1.2.1 (first on B).
        let mut branch_rev = rev(1, 0, 500, Some(0));
        if let CvsItem::Revision(r) = &mut branch_rev {
            r.lod = Lod::Branch(SymbolId(0));
            r.first_on_branch = true;
        }
        let items = vec![
            rev(0, 0, 100, None),
            branch_rev,
            CvsItem::Symbol(CvsSymbol {
                id: ItemId(2),
                symbol: SymbolId(0),
                file: FileId(0),
                source: ItemId(0),
            }),
        ];
        let changesets = vec![
            changeset(0, &[0], 100),
            changeset(1, &[1], 500),
            Changeset {
                id: ChangesetId(2),
                kind: ChangesetKind::Branch(SymbolId(0)),
                items: vec![ItemId(2)],
                t_min: 100,
                t_max: 100,
                metadata: None,
            },
        ];
        let order = Scheduler::new(changesets, &items).run().unwrap();
        let position = |id: u32| order.iter().position(|c| c.id.0 == id).unwrap();
        assert!(position(2) < position(1), "fill must precede the first branch commit");
        assert!(position(0) < position(2));
    }

    #[test]
    fn peels_symbol_cycle_into_secondary_fill() {
        // Branch B sprouts from a1 (cs0) and from b1 (cs2). The first commit
        // on B (cs1) must follow the fill, but cs2 depends on cs1 through a
        // prev edge, closing a cycle through the symbol changeset.
        let mut branch_rev = rev(1, 0, 200, Some(0));
        if let CvsItem::Revision(r) = &mut branch_rev {
            r.lod = Lod::Branch(SymbolId(0));
            r.first_on_branch = true;
        }
        let items = vec![
            rev(0, 0, 100, None), // a1
            branch_rev,           // a's first commit on B
            rev(2, 1, 300, Some(1)), // b1, artificially depends on the branch commit
            CvsItem::Symbol(CvsSymbol {
                id: ItemId(3),
                symbol: SymbolId(0),
                file: FileId(0),
                source: ItemId(0),
            }),
            CvsItem::Symbol(CvsSymbol {
                id: ItemId(4),
                symbol: SymbolId(0),
                file: FileId(1),
                source: ItemId(2),
            }),
        ];
        let changesets = vec![
            changeset(0, &[0], 100),
            changeset(1, &[1], 200),
            changeset(2, &[2], 300),
            Changeset {
                id: ChangesetId(3),
                kind: ChangesetKind::Branch(SymbolId(0)),
                items: vec![ItemId(3), ItemId(4)],
                t_min: 100,
                t_max: 300,
                metadata: None,
            },
        ];
        let order = Scheduler::new(changesets, &items).run().unwrap();
        // One symbol changeset became two.
        let fills: Vec<&Changeset> = order.iter().filter(|c| !c.is_revision()).collect();
        assert_eq!(fills.len(), 2);
        let position = |id: ChangesetId| order.iter().position(|c| c.id == id).unwrap();
        // Primary fill before the branch commit, secondary after its source.
        let primary = fills.iter().find(|c| c.items.contains(&ItemId(3))).unwrap();
        let secondary = fills.iter().find(|c| c.items.contains(&ItemId(4))).unwrap();
        assert!(position(primary.id) < order.iter().position(|c| c.id.0 == 1).unwrap());
        assert!(position(secondary.id) > order.iter().position(|c| c.id.0 == 2).unwrap());
        assert!(position(secondary.id) > position(primary.id));
    }
}
