//! Choosing copy sources when filling a tag or branch.
//!
//! The symbolings index yields, per file, the SVN revision range a symbol
//! can be copied from and the line of development that range lives on.
//! Ranges are grouped by source LOD into sparse trees mirroring the
//! directory hierarchy; each subtree is then copied from the (LOD, revnum)
//! pair covering the most files, recursing only where the sources disagree.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use itertools::Itertools;

use crate::model::Lod;
use crate::symbolings::SvnRevisionRange;
use crate::symbolings::SymbolSource;

/// A sparse directory tree of revision ranges for one source LOD.
#[derive(Debug, Default)]
pub struct FillNode {
    children: BTreeMap<String, FillNode>,
    /// Present on file leaves.
    range: Option<SvnRevisionRange>,
}

impl FillNode {
    fn insert(&mut self, components: &[&str], range: SvnRevisionRange) {
        match components {
            [] => self.range = Some(range),
            [first, rest @ ..] => {
                self.children.entry(first.to_string()).or_default().insert(rest, range)
            }
        }
    }

    /// How many file leaves are valid copy sources at `revnum`.
    pub fn score(&self, revnum: u32) -> usize {
        let own = self.range.map_or(0, |r| r.covers(revnum) as usize);
        own + self.children.values().map(|c| c.score(revnum)).sum::<usize>()
    }

    fn collect_events(&self, events: &mut Vec<(u32, i64)>) {
        if let Some(range) = self.range {
            events.push((range.opening, 1));
            if let Some(closing) = range.closing {
                events.push((closing, -1));
            }
        }
        for child in self.children.values() {
            child.collect_events(events);
        }
    }

    /// The revnum with the highest score. Ties prefer `preferred` (to share
    /// the parent's copy), then the lowest revnum.
    pub fn best_revnum(&self, preferred: Option<u32>) -> (u32, usize) {
        let mut events = Vec::new();
        self.collect_events(&mut events);
        events.sort();

        let mut best: Option<(u32, usize)> = None;
        let mut count: i64 = 0;
        for (revnum, group) in &events.iter().group_by(|(revnum, _)| *revnum) {
            count += group.map(|(_, delta)| delta).sum::<i64>();
            let score = count as usize;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((revnum, score));
            }
        }
        let (revnum, score) = best.unwrap_or((0, 0));
        if let Some(preferred) = preferred {
            if self.score(preferred) == score {
                return (preferred, score);
            }
        }
        (revnum, score)
    }

    fn is_leaf(&self) -> bool {
        self.range.is_some()
    }
}

/// All copy sources for one LOD.
#[derive(Debug)]
pub struct FillSource {
    pub lod: Lod,
    pub root: FillNode,
}

/// Group symbol sources by their LOD into per-LOD trees.
pub fn build_fill_sources(
    sources: &[SymbolSource],
    svn_path_of: impl Fn(crate::model::FileId) -> String,
) -> Vec<FillSource> {
    let mut by_lod: BTreeMap<Lod, FillNode> = BTreeMap::new();
    for source in sources {
        let path = svn_path_of(source.file);
        let components: Vec<&str> = path.split('/').collect();
        by_lod.entry(source.source_lod).or_default().insert(&components, source.range);
    }
    by_lod.into_iter().map(|(lod, root)| FillSource { lod, root }).collect()
}

/// The tree operations a fill needs from the repository mirror.
pub trait FillTarget {
    /// Child entry names of a directory at a past revision; empty for files
    /// and missing paths.
    fn entries(&self, path: &str, revnum: u32) -> Vec<String>;
    /// Does the path exist in the revision being built?
    fn exists(&self, path: &str) -> bool;
    fn copy(&mut self, src: &str, src_revnum: u32, dest: &str) -> Result<()>;
    fn delete(&mut self, path: &str) -> Result<()>;
}

pub struct Filler<'a> {
    target: &'a mut dyn FillTarget,
    /// Maps a source LOD to its base path (`trunk`, `branches/NAME`).
    lod_base: &'a dyn Fn(Lod) -> String,
}

impl<'a> Filler<'a> {
    pub fn new(target: &'a mut dyn FillTarget, lod_base: &'a dyn Fn(Lod) -> String) -> Self {
        Self { target, lod_base }
    }

    /// Materialise `dest` from the given sources.
    ///
    /// When `dest` already exists (secondary fills), only the subtrees named
    /// by the sources are touched; nothing else is pruned.
    pub fn fill(&mut self, dest: &str, sources: &[FillSource]) -> Result<()> {
        if sources.iter().all(|s| s.root.children.is_empty() && !s.root.is_leaf()) {
            bail!("fill of {} has no copy sources", dest);
        }
        let nodes: Vec<(Lod, &FillNode)> = sources.iter().map(|s| (s.lod, &s.root)).collect();
        if self.target.exists(dest) {
            let names: BTreeSet<&String> =
                nodes.iter().flat_map(|(_, n)| n.children.keys()).collect();
            for name in names {
                let child_nodes = children_named(&nodes, name);
                self.fill_node(&join(dest, name), name, child_nodes, None, false)?;
            }
            return Ok(());
        }
        self.fill_node(dest, "", nodes, None, true)
    }

    fn fill_node(
        &mut self,
        dest: &str,
        subpath: &str,
        nodes: Vec<(Lod, &FillNode)>,
        parent: Option<(Lod, u32)>,
        prune: bool,
    ) -> Result<()> {
        let (lod, revnum) = choose(&nodes, parent)
            .with_context(|| format!("no usable copy source for {}", dest))?;
        let src = join(&(self.lod_base)(lod), subpath);

        if parent != Some((lod, revnum)) {
            if self.target.exists(dest) {
                self.target.delete(dest)?;
            }
            self.target.copy(&src, revnum, dest)?;
        }

        let copied: BTreeSet<String> = self.target.entries(&src, revnum).into_iter().collect();
        let names: BTreeSet<String> =
            nodes.iter().flat_map(|(_, n)| n.children.keys().cloned()).collect();

        for name in &names {
            let child_nodes = children_named(&nodes, name);
            if satisfied(&child_nodes, lod, revnum) {
                continue;
            }
            let child_dest = join(dest, name);
            let child_sub = join(subpath, name);
            self.fill_node(&child_dest, &child_sub, child_nodes, Some((lod, revnum)), prune)?;
        }

        if prune {
            for name in copied.difference(&names) {
                self.target.delete(&join(dest, name))?;
            }
        }
        Ok(())
    }
}

fn children_named<'n>(nodes: &[(Lod, &'n FillNode)], name: &str) -> Vec<(Lod, &'n FillNode)> {
    nodes
        .iter()
        .filter_map(|(lod, node)| node.children.get(name).map(|c| (*lod, c)))
        .collect()
}

/// Is every file under these nodes covered by the copy already made from
/// (lod, revnum)?
fn satisfied(nodes: &[(Lod, &FillNode)], lod: Lod, revnum: u32) -> bool {
    let Some((_, chosen)) = nodes.iter().find(|(l, _)| *l == lod) else {
        return false;
    };
    let names: BTreeSet<&String> = nodes.iter().flat_map(|(_, n)| n.children.keys()).collect();
    let leaves = nodes.iter().any(|(_, n)| n.is_leaf());
    if leaves {
        if names.is_empty() {
            return chosen.range.is_some_and(|r| r.covers(revnum));
        }
        // A path that is a file in one source and a directory in another
        // can only be handled by recursing.
        return false;
    }
    names.iter().all(|name| satisfied(&children_named(nodes, name), lod, revnum))
}

/// Pick the (LOD, revnum) covering the most files.
///
/// Within one LOD the tie-break lives in [FillNode::best_revnum] (prefer the
/// parent's revnum, then the lowest). Across LODs, a candidate equal to the
/// parent's choice wins, then the lowest revnum, then trunk before branches.
fn choose(nodes: &[(Lod, &FillNode)], parent: Option<(Lod, u32)>) -> Option<(Lod, u32)> {
    nodes
        .iter()
        .filter_map(|(lod, node)| {
            let preferred = parent.filter(|(l, _)| l == lod).map(|(_, r)| r);
            let (revnum, score) = node.best_revnum(preferred);
            (score > 0).then_some((score, *lod, revnum))
        })
        .min_by_key(|&(score, lod, revnum)| {
            (Reverse(score), parent != Some((lod, revnum)), revnum, lod)
        })
        .map(|(_, lod, revnum)| (lod, revnum))
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::FileId;

    fn range(opening: u32, closing: Option<u32>) -> SvnRevisionRange {
        SvnRevisionRange { opening, closing }
    }

    fn source(file: u32, lod: Lod, r: SvnRevisionRange) -> SymbolSource {
        SymbolSource { file: FileId(file), source_lod: lod, range: r }
    }

    /// A fake mirror: `past` maps (path, revnum) presence, `current` is the
    /// revision under construction. Copies clone the past subtree.
    #[derive(Default)]
    struct FakeTarget {
        past: Vec<(String, u32)>,
        current: BTreeSet<String>,
        ops: Vec<String>,
    }

    impl FakeTarget {
        fn with_past(paths: &[(&str, u32)]) -> Self {
            Self {
                past: paths.iter().map(|(p, r)| (p.to_string(), *r)).collect(),
                ..Default::default()
            }
        }
    }

    impl FillTarget for FakeTarget {
        fn entries(&self, path: &str, revnum: u32) -> Vec<String> {
            let prefix = format!("{}/", path);
            self.past
                .iter()
                .filter(|(p, r)| *r == revnum && p.starts_with(&prefix))
                .map(|(p, _)| p[prefix.len()..].split('/').next().unwrap().to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }

        fn exists(&self, path: &str) -> bool {
            let prefix = format!("{}/", path);
            self.current.iter().any(|p| p == path || p.starts_with(&prefix))
        }

        fn copy(&mut self, src: &str, src_revnum: u32, dest: &str) -> Result<()> {
            self.ops.push(format!("copy {}@{} -> {}", src, src_revnum, dest));
            let prefix = format!("{}/", src);
            let copied: Vec<String> = self
                .past
                .iter()
                .filter(|(p, r)| *r == src_revnum && (p == src || p.starts_with(&prefix)))
                .map(|(p, _)| {
                    if p == src {
                        dest.to_string()
                    } else {
                        format!("{}/{}", dest, &p[prefix.len()..])
                    }
                })
                .collect();
            self.current.extend(copied);
            self.current.insert(dest.to_string());
            Ok(())
        }

        fn delete(&mut self, path: &str) -> Result<()> {
            self.ops.push(format!("delete {}", path));
            let prefix = format!("{}/", path);
            self.current.retain(|p| p != path && !p.starts_with(&prefix));
            Ok(())
        }
    }

    #[test]
    fn best_revnum_maximises_coverage() {
        let mut node = FillNode::default();
        node.insert(&["a"], range(2, Some(5)));
        node.insert(&["b"], range(3, None));
        node.insert(&["c"], range(3, Some(4)));
        // Revnum 3 covers all three files.
        assert_eq!(node.best_revnum(None), (3, 3));
        assert_eq!(node.score(2), 1);
        assert_eq!(node.score(4), 2);
    }

    #[test]
    fn best_revnum_prefers_preferred_on_ties() {
        let mut node = FillNode::default();
        node.insert(&["a"], range(2, None));
        node.insert(&["b"], range(4, Some(6)));
        // Scores: r2 = 1, r4..5 = 2. Preferred 5 matches the max score.
        assert_eq!(node.best_revnum(Some(5)), (5, 2));
        assert_eq!(node.best_revnum(None), (4, 2));
    }

    #[test]
    fn single_copy_when_one_source_covers_everything() {
        let sources = vec![
            source(0, Lod::Trunk, range(3, None)),
            source(1, Lod::Trunk, range(2, None)),
        ];
        let files: HashMap<FileId, &str> =
            [(FileId(0), "dir/a"), (FileId(1), "dir/b")].into_iter().collect();
        let fill_sources = build_fill_sources(&sources, |f| files[&f].to_string());

        let mut target = FakeTarget::with_past(&[
            ("trunk/dir/a", 3),
            ("trunk/dir/b", 3),
            ("trunk/dir", 3),
        ]);
        let lod_base = |_: Lod| "trunk".to_string();
        Filler::new(&mut target, &lod_base).fill("tags/T", &fill_sources).unwrap();
        assert_eq!(target.ops, vec!["copy trunk@3 -> tags/T"]);
    }

    #[test]
    fn disagreeing_file_is_recopied() {
        // File b's source range closed before file a's opened: no single
        // revnum covers both, so the uncovered file gets its own copy.
        let sources = vec![
            source(0, Lod::Trunk, range(5, None)),
            source(1, Lod::Trunk, range(2, Some(4))),
        ];
        let files: HashMap<FileId, &str> =
            [(FileId(0), "a"), (FileId(1), "b")].into_iter().collect();
        let fill_sources = build_fill_sources(&sources, |f| files[&f].to_string());

        let mut target = FakeTarget::with_past(&[
            ("trunk/a", 5),
            ("trunk/b", 5),
            ("trunk/b", 2),
        ]);
        let lod_base = |_: Lod| "trunk".to_string();
        Filler::new(&mut target, &lod_base).fill("tags/T", &fill_sources).unwrap();
        assert_eq!(
            target.ops,
            vec!["copy trunk@2 -> tags/T", "copy trunk/a@5 -> tags/T/a"]
        );
    }

    #[test]
    fn copied_extras_are_pruned() {
        let sources = vec![source(0, Lod::Trunk, range(3, None))];
        let files: HashMap<FileId, &str> = [(FileId(0), "a")].into_iter().collect();
        let fill_sources = build_fill_sources(&sources, |f| files[&f].to_string());

        // trunk@3 also contains "extra", which the tag must not include.
        let mut target = FakeTarget::with_past(&[("trunk/a", 3), ("trunk/extra", 3)]);
        let lod_base = |_: Lod| "trunk".to_string();
        Filler::new(&mut target, &lod_base).fill("tags/T", &fill_sources).unwrap();
        assert_eq!(target.ops, vec!["copy trunk@3 -> tags/T", "delete tags/T/extra"]);
    }

    #[test]
    fn secondary_fill_touches_only_its_files() {
        let sources = vec![source(0, Lod::Trunk, range(6, None))];
        let files: HashMap<FileId, &str> = [(FileId(0), "b")].into_iter().collect();
        let fill_sources = build_fill_sources(&sources, |f| files[&f].to_string());

        let mut target = FakeTarget::with_past(&[("trunk/b", 6)]);
        // The branch already exists from the primary fill.
        target.current.insert("branches/B".to_string());
        target.current.insert("branches/B/a".to_string());
        let lod_base = |_: Lod| "trunk".to_string();
        Filler::new(&mut target, &lod_base).fill("branches/B", &fill_sources).unwrap();
        assert_eq!(target.ops, vec!["copy trunk/b@6 -> branches/B/b"]);
        assert!(target.current.contains("branches/B/a"));
    }

    #[test]
    fn empty_sources_are_an_error() {
        let fill_sources = build_fill_sources(&[], |_| unreachable!());
        let mut target = FakeTarget::default();
        let lod_base = |_: Lod| "trunk".to_string();
        assert!(Filler::new(&mut target, &lod_base).fill("tags/T", &fill_sources).is_err());
    }

    #[test]
    fn mixed_lod_sources_pick_the_covering_branch() {
        // a comes from trunk, b only from branch OLD; the planner must copy
        // the bulk from one LOD and patch the other file from its own LOD.
        let sources = vec![
            source(0, Lod::Trunk, range(3, None)),
            source(1, Lod::Branch(crate::model::SymbolId(9)), range(4, None)),
        ];
        let files: HashMap<FileId, &str> =
            [(FileId(0), "a"), (FileId(1), "b")].into_iter().collect();
        let fill_sources = build_fill_sources(&sources, |f| files[&f].to_string());

        let mut target =
            FakeTarget::with_past(&[("trunk/a", 3), ("branches/OLD/b", 4)]);
        let lod_base = |lod: Lod| match lod {
            Lod::Trunk => "trunk".to_string(),
            Lod::Branch(_) => "branches/OLD".to_string(),
        };
        Filler::new(&mut target, &lod_base).fill("tags/T", &fill_sources).unwrap();
        assert_eq!(
            target.ops,
            vec!["copy trunk@3 -> tags/T", "copy branches/OLD/b@4 -> tags/T/b"]
        );
    }
}
