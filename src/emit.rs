//! Driving the repository mirror through the scheduled commit stream.

use std::collections::HashSet;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;

use crate::commit::SvnCommit;
use crate::commit::SvnCommitVariant;
use crate::fill::build_fill_sources;
use crate::fill::Filler;
use crate::model::CvsFile;
use crate::model::CvsItem;
use crate::model::CvsRevision;
use crate::model::ItemId;
use crate::model::Lod;
use crate::model::RevOp;
use crate::model::SymbolId;
use crate::model::SymbolType;
use crate::mirror::Mirror;
use crate::mirror::PathItem;
use crate::mirror::RevProps;
use crate::project::Layout;
use crate::store::FillHistory;
use crate::symbolings::SymbolingsIndex;
use crate::symbols::SymbolRegistry;

pub struct Emitter<'a> {
    pub mirror: &'a mut Mirror,
    pub layout: &'a Layout,
    pub files: &'a [CvsFile],
    pub items: &'a [CvsItem],
    pub registry: &'a SymbolRegistry,
    pub types: &'a [SymbolType],
    pub symbolings: &'a SymbolingsIndex,
    pub prune: bool,
    pub fill_history: FillHistory,
}

impl<'a> Emitter<'a> {
    pub fn run(&mut self, commits: impl Iterator<Item = Result<SvnCommit>>) -> Result<()> {
        for commit in commits {
            let commit = commit?;
            let props = RevProps {
                author: commit.author.clone(),
                date: commit.date,
                log: commit.log.clone(),
            };
            self.mirror.start_commit(commit.revnum, &props)?;
            match &commit.variant {
                SvnCommitVariant::InitialProject => self.initial_project()?,
                SvnCommitVariant::Primary { items } => self
                    .primary(items)
                    .with_context(|| format!("while emitting r{}", commit.revnum))?,
                SvnCommitVariant::SymbolFill { symbol, items } => self
                    .symbol_fill(commit.revnum, *symbol, items)
                    .with_context(|| format!("while filling at r{}", commit.revnum))?,
                SvnCommitVariant::PostCommit { motivating, items } => self
                    .post_commit(*motivating, items)
                    .with_context(|| format!("while emitting post-commit r{}", commit.revnum))?,
            }
            self.mirror.end_commit();
        }
        self.mirror.finish()
    }

    fn revision(&self, id: ItemId) -> &'a CvsRevision {
        self.items[id.index()].as_revision().expect("expected a revision item")
    }

    fn file(&self, rev: &CvsRevision) -> &'a CvsFile {
        &self.files[rev.file.index()]
    }

    fn lod_base(&self, lod: Lod) -> String {
        match lod {
            Lod::Trunk => self.layout.trunk.clone(),
            Lod::Branch(symbol) => format!(
                "{}/{}",
                self.layout.branches,
                self.registry.get(symbol).cleaned_name
            ),
        }
    }

    fn svn_path(&self, rev: &CvsRevision) -> String {
        format!("{}/{}", self.lod_base(rev.lod), self.file(rev).svn_path)
    }

    fn path_item(&self, rev: &CvsRevision, path: String) -> PathItem {
        let file = self.file(rev);
        PathItem {
            path,
            rcs_path: file.rcs_path.clone(),
            rev: rev.rev.clone(),
            executable: file.executable,
        }
    }

    fn initial_project(&mut self) -> Result<()> {
        self.mirror.mkdir(&self.layout.trunk)?;
        if !self.layout.trunk_only {
            self.mirror.mkdir(&self.layout.branches)?;
            self.mirror.mkdir(&self.layout.tags)?;
        }
        Ok(())
    }

    fn primary(&mut self, items: &[ItemId]) -> Result<()> {
        let mut revisions: Vec<&CvsRevision> = items.iter().map(|&id| self.revision(id)).collect();
        revisions.sort_by_key(|r| (self.file(r).svn_path.clone(), r.rev.clone()));

        for rev in revisions {
            if let Some(branch) = rev.lod.branch_id() {
                if self.fill_history.last_filled(branch).is_none() {
                    bail!(
                        "commit on branch {:?} before any fill of it",
                        self.registry.get(branch).name
                    );
                }
            }

            let path = self.svn_path(rev);
            // A vendor import identical to 1.1: the path already carries the
            // right content.
            if rev.rev.components() == [1, 1, 1, 1]
                && !rev.deltatext_exists
                && self.mirror.path_exists(&path)
            {
                continue;
            }

            match rev.op {
                RevOp::Add => {
                    let item = self.path_item(rev, path);
                    self.mirror.ensure_parent(&item.path)?;
                    self.mirror.add_file(&item)?;
                }
                RevOp::Change => {
                    let item = self.path_item(rev, path);
                    if self.mirror.path_exists(&item.path) {
                        self.mirror.change_file(&item)?;
                    } else {
                        // First change on trunk after the file lived only in
                        // a dead state or on a branch.
                        self.mirror.ensure_parent(&item.path)?;
                        self.mirror.add_file(&item)?;
                    }
                }
                RevOp::Delete => {
                    if self.mirror.path_exists(&path) {
                        self.mirror.delete_path(&path, self.prune)?;
                    } else {
                        log::debug!("delete of missing path {} ignored", path);
                    }
                }
                RevOp::Noop => {}
            }
        }
        Ok(())
    }

    fn post_commit(&mut self, motivating: u32, items: &[ItemId]) -> Result<()> {
        let mut revisions: Vec<&CvsRevision> = items.iter().map(|&id| self.revision(id)).collect();
        revisions.sort_by_key(|r| self.file(r).svn_path.clone());

        for rev in revisions {
            let branch_path = self.svn_path(rev);
            let trunk_path = format!("{}/{}", self.layout.trunk, self.file(rev).svn_path);
            match rev.op {
                RevOp::Add | RevOp::Change => {
                    if self.mirror.path_exists(&trunk_path) {
                        self.mirror.delete_path(&trunk_path, false)?;
                    }
                    self.mirror.ensure_parent(&trunk_path)?;
                    self.mirror.copy_path(&branch_path, motivating, &trunk_path)?;
                }
                RevOp::Delete => {
                    if self.mirror.path_exists(&trunk_path) {
                        self.mirror.delete_path(&trunk_path, self.prune)?;
                    }
                }
                RevOp::Noop => {
                    bail!("cannot sync a {} revision of {} to trunk", rev.op, branch_path)
                }
            }
        }
        Ok(())
    }

    fn symbol_fill(&mut self, revnum: u32, symbol: SymbolId, items: &[ItemId]) -> Result<()> {
        let files: HashSet<_> = items
            .iter()
            .filter_map(|&id| self.items[id.index()].as_symbol())
            .map(|s| s.file)
            .collect();
        let sources = self.symbolings.sources(symbol, revnum, Some(&files));

        let symbol_type = self.types[symbol.index()];
        let dest = format!(
            "{}/{}",
            self.layout.symbol_base(symbol_type),
            self.registry.get(symbol).cleaned_name
        );

        if sources.is_empty() {
            self.empty_fill(revnum, symbol, &dest)?;
        } else {
            let fill_sources = build_fill_sources(&sources, |file| {
                self.files[file.index()].svn_path.clone()
            });
            let layout = self.layout;
            let registry = self.registry;
            let lod_base = move |lod: Lod| match lod {
                Lod::Trunk => layout.trunk.clone(),
                Lod::Branch(s) => {
                    format!("{}/{}", layout.branches, registry.get(s).cleaned_name)
                }
            };
            Filler::new(&mut *self.mirror, &lod_base).fill(&dest, &fill_sources)?;
        }

        self.fill_history.record(symbol, revnum);
        Ok(())
    }

    /// A symbol with no copy sources yet (e.g. a branch whose first commit
    /// is an add, or whose first action deletes the file): create it as a
    /// copy of trunk with everything deleted again.
    fn empty_fill(&mut self, revnum: u32, symbol: SymbolId, dest: &str) -> Result<()> {
        if self.mirror.path_exists(dest) {
            bail!(
                "symbol {:?} already exists at {} but has nothing to fill it with",
                self.registry.get(symbol).name,
                dest
            );
        }
        let source_revnum = revnum - 1;
        self.mirror.copy_path(&self.layout.trunk, source_revnum, dest)?;
        for entry in self.mirror.entries_at(&self.layout.trunk, source_revnum)? {
            self.mirror.delete_path(&format!("{}/{}", dest, entry), false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::changeset::Changeset;
    use crate::changeset::ChangesetKind;
    use crate::commit::layout_commits;
    use crate::metadata::Metadata;
    use crate::mirror::testing::RecordingDelegate;
    use crate::model::ChangesetId;
    use crate::model::CvsSymbol;
    use crate::model::FileId;
    use crate::model::MetadataId;

    struct Fixture {
        files: Vec<CvsFile>,
        items: Vec<CvsItem>,
        registry: SymbolRegistry,
        types: Vec<SymbolType>,
        changesets: Vec<Changeset>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                files: Vec::new(),
                items: Vec::new(),
                registry: SymbolRegistry::new(),
                types: Vec::new(),
                changesets: Vec::new(),
            }
        }

        fn file(&mut self, svn_path: &str) -> FileId {
            let id = FileId(self.files.len() as u32);
            self.files.push(CvsFile {
                id,
                rcs_path: format!("/repo/{},v", svn_path),
                svn_path: svn_path.to_string(),
                executable: false,
                size: 0,
                in_attic: false,
            });
            id
        }

        fn symbol(&mut self, name: &str, symbol_type: SymbolType) -> SymbolId {
            let id = self.registry.intern(name, name.to_string());
            self.types.push(symbol_type);
            id
        }

        fn revision(&mut self, file: FileId, rev: &str, ts: i64, op: RevOp, lod: Lod) -> ItemId {
            let id = ItemId(self.items.len() as u32);
            let rev: crate::rcs::RevNum = rev.parse().unwrap();
            let first_on_branch = rev.is_first_on_branch();
            self.items.push(CvsItem::Revision(CvsRevision {
                id,
                file,
                rev,
                timestamp: ts,
                metadata: MetadataId(0),
                op,
                prev: None,
                next: None,
                lod,
                branches: Vec::new(),
                tags: Vec::new(),
                closed_symbols: Vec::new(),
                default_branch_revision: false,
                deltatext_exists: true,
                first_on_branch,
            }));
            id
        }

        fn occurrence(&mut self, symbol: SymbolId, file: FileId, source: ItemId) -> ItemId {
            let id = ItemId(self.items.len() as u32);
            if let CvsItem::Revision(rev) = &mut self.items[source.index()] {
                match self.types[symbol.index()] {
                    SymbolType::Tag => rev.tags.push(symbol),
                    _ => rev.branches.push(symbol),
                }
            }
            self.items.push(CvsItem::Symbol(CvsSymbol { id, symbol, file, source }));
            id
        }

        fn revision_changeset(&mut self, items: &[ItemId], t: i64) -> ChangesetId {
            let id = ChangesetId(self.changesets.len() as u32);
            self.changesets.push(Changeset {
                id,
                kind: ChangesetKind::Revision,
                items: items.to_vec(),
                t_min: t,
                t_max: t,
                metadata: Some(MetadataId(0)),
            });
            id
        }

        fn symbol_changeset(&mut self, symbol: SymbolId, items: &[ItemId], t: i64) -> ChangesetId {
            let id = ChangesetId(self.changesets.len() as u32);
            let kind = match self.types[symbol.index()] {
                SymbolType::Tag => ChangesetKind::Tag(symbol),
                _ => ChangesetKind::Branch(symbol),
            };
            self.changesets.push(Changeset {
                id,
                kind,
                items: items.to_vec(),
                t_min: t,
                t_max: t,
                metadata: None,
            });
            id
        }

        /// Lay out and emit everything, returning the delegate's op log.
        fn emit(&self, prune: bool) -> Vec<String> {
            let metadata = vec![Metadata { author: "a".to_string(), log: "log".to_string() }];
            let layout =
                layout_commits(&self.changesets, &self.items, &metadata, &self.registry, &self.types)
                    .unwrap();

            let project_layout = Layout::new("trunk", "branches", "tags", false).unwrap();
            let mut mirror = Mirror::new(&["trunk", "branches", "tags"]);
            let ops = Rc::new(RefCell::new(Vec::new()));
            mirror.add_delegate(Box::new(RecordingDelegate { ops: ops.clone() }));

            let mut emitter = Emitter {
                mirror: &mut mirror,
                layout: &project_layout,
                files: &self.files,
                items: &self.items,
                registry: &self.registry,
                types: &self.types,
                symbolings: &layout.symbolings,
                prune,
                fill_history: FillHistory::new(),
            };
            emitter.run(layout.commits.iter().cloned().map(Ok)).unwrap();
            let ops = ops.borrow().clone();
            ops
        }
    }

    #[test]
    fn initial_project_makes_the_skeleton() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let r = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        fx.revision_changeset(&[r], 100);
        let ops = fx.emit(true);
        assert_eq!(
            &ops[..5],
            &[
                "start r1",
                "mkdir trunk",
                "mkdir branches",
                "mkdir tags",
                "start r2",
            ]
        );
        assert_eq!(ops[5], "add trunk/a.txt");
    }

    #[test]
    fn adds_create_missing_directories() {
        let mut fx = Fixture::new();
        let f = fx.file("deep/dir/a.txt");
        let r = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        fx.revision_changeset(&[r], 100);
        let ops = fx.emit(true);
        assert!(ops.contains(&"mkdir trunk/deep".to_string()));
        assert!(ops.contains(&"mkdir trunk/deep/dir".to_string()));
        assert!(ops.contains(&"add trunk/deep/dir/a.txt".to_string()));
    }

    #[test]
    fn prune_with_care_scenario() {
        let mut fx = Fixture::new();
        let cookie = fx.file("a/cookie");
        let news = fx.file("a/NEWS");
        let r1 = fx.revision(cookie, "1.1", 100, RevOp::Add, Lod::Trunk);
        let r2 = fx.revision(news, "1.1", 1000, RevOp::Add, Lod::Trunk);
        let r3 = fx.revision(cookie, "1.2", 2000, RevOp::Delete, Lod::Trunk);
        let r5 = fx.revision(news, "1.2", 3000, RevOp::Delete, Lod::Trunk);
        for (item, t) in [(r1, 100), (r2, 1000), (r3, 2000), (r5, 3000)] {
            fx.revision_changeset(&[item], t);
        }
        let ops = fx.emit(true);
        // The first delete removes only the file; the second prunes the dir.
        assert!(ops.contains(&"delete trunk/a/cookie".to_string()));
        assert!(ops.contains(&"delete trunk/a".to_string()));
        assert!(!ops.contains(&"delete trunk/a/NEWS".to_string()));
    }

    #[test]
    fn delete_of_missing_path_is_ignored() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let r = fx.revision(f, "1.1", 100, RevOp::Delete, Lod::Trunk);
        fx.revision_changeset(&[r], 100);
        let ops = fx.emit(true);
        assert!(!ops.iter().any(|op| op.starts_with("delete")));
    }

    #[test]
    fn tag_fill_copies_from_the_source_revision() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let tag = fx.symbol("REL", SymbolType::Tag);
        let r1 = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        let occurrence = fx.occurrence(tag, f, r1);
        fx.revision_changeset(&[r1], 100);
        fx.symbol_changeset(tag, &[occurrence], 100);
        let ops = fx.emit(true);
        assert!(
            ops.contains(&"copy trunk@2 -> tags/REL (dir)".to_string()),
            "ops were: {:?}",
            ops
        );
    }

    #[test]
    fn branch_fill_precedes_branch_commits() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let branch = fx.symbol("B", SymbolType::Branch);
        let r1 = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        let occurrence = fx.occurrence(branch, f, r1);
        let b1 = fx.revision(f, "1.1.2.1", 500, RevOp::Change, Lod::Branch(branch));
        fx.revision_changeset(&[r1], 100);
        fx.symbol_changeset(branch, &[occurrence], 100);
        fx.revision_changeset(&[b1], 500);
        let ops = fx.emit(true);
        let copy_at = ops.iter().position(|op| op.starts_with("copy trunk@2 -> branches/B"));
        let change_at = ops.iter().position(|op| op == "change branches/B/a.txt");
        assert!(copy_at.unwrap() < change_at.unwrap(), "ops were: {:?}", ops);
    }

    #[test]
    fn branch_delete_first_gets_an_empty_fill() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let branch = fx.symbol("B", SymbolType::Branch);
        let r1 = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        let b1 = fx.revision(f, "1.1.2.1", 500, RevOp::Delete, Lod::Branch(branch));
        fx.revision_changeset(&[r1], 100);
        // The branch changeset has no occurrences: nothing sourced it yet.
        fx.symbol_changeset(branch, &[], 400);
        fx.revision_changeset(&[b1], 500);
        let ops = fx.emit(true);
        // Empty fill: copy trunk, then delete the copied file again.
        assert!(ops.contains(&"copy trunk@2 -> branches/B (dir)".to_string()));
        assert!(ops.contains(&"delete branches/B/a.txt".to_string()));
        // The later branch delete of a missing path stays a no-op.
        let deletes: Vec<_> =
            ops.iter().filter(|op| *op == &"delete branches/B/a.txt".to_string()).collect();
        assert_eq!(deletes.len(), 1);
    }

    #[test]
    fn vendor_identity_import_is_skipped() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let vendor = fx.symbol("VENDOR", SymbolType::Branch);
        let r1 = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        let v1 = fx.revision(f, "1.1.1.1", 100, RevOp::Add, Lod::Branch(vendor));
        if let CvsItem::Revision(rev) = &mut fx.items[v1.index()] {
            rev.deltatext_exists = false;
            rev.default_branch_revision = true;
        }
        let occurrence = fx.occurrence(vendor, f, r1);
        fx.revision_changeset(&[r1], 100);
        fx.symbol_changeset(vendor, &[occurrence], 100);
        fx.revision_changeset(&[v1], 200);
        let ops = fx.emit(true);
        // One add on trunk; the branch-side 1.1.1.1 emits nothing.
        let adds: Vec<_> = ops.iter().filter(|op| op.starts_with("add")).collect();
        assert_eq!(adds, vec!["add trunk/a.txt"], "ops were: {:?}", ops);
    }

    #[test]
    fn default_branch_sync_copies_to_trunk() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let vendor = fx.symbol("VENDOR", SymbolType::Branch);
        let r1 = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        let occurrence = fx.occurrence(vendor, f, r1);
        let v2 = fx.revision(f, "1.1.1.2", 500, RevOp::Change, Lod::Branch(vendor));
        if let CvsItem::Revision(rev) = &mut fx.items[v2.index()] {
            rev.default_branch_revision = true;
        }
        let r2 = fx.revision(f, "1.2", 900, RevOp::Change, Lod::Trunk);
        fx.revision_changeset(&[r1], 100);
        fx.symbol_changeset(vendor, &[occurrence], 100);
        fx.revision_changeset(&[v2], 500);
        fx.revision_changeset(&[r2], 900);
        let ops = fx.emit(true);
        // The post-commit replaces trunk's copy with the branch content at
        // the motivating revnum, then 1.2 changes trunk normally.
        let sync_delete = ops.iter().position(|op| op == "delete trunk/a.txt");
        let sync_copy = ops
            .iter()
            .position(|op| op.starts_with("copy branches/VENDOR/a.txt@4 -> trunk/a.txt"));
        let trunk_change = ops.iter().position(|op| op == "change trunk/a.txt");
        assert!(sync_delete.unwrap() < sync_copy.unwrap(), "ops were: {:?}", ops);
        assert!(sync_copy.unwrap() < trunk_change.unwrap());
    }

    #[test]
    fn trunk_only_suppresses_branches_and_tags_dirs() {
        let mut fx = Fixture::new();
        let f = fx.file("a.txt");
        let r = fx.revision(f, "1.1", 100, RevOp::Add, Lod::Trunk);
        fx.revision_changeset(&[r], 100);

        let metadata = vec![Metadata { author: "a".to_string(), log: "log".to_string() }];
        let layout =
            layout_commits(&fx.changesets, &fx.items, &metadata, &fx.registry, &fx.types).unwrap();
        let project_layout = Layout::new("trunk", "branches", "tags", true).unwrap();
        let mut mirror = Mirror::new(&["trunk"]);
        let ops = Rc::new(RefCell::new(Vec::new()));
        mirror.add_delegate(Box::new(RecordingDelegate { ops: ops.clone() }));
        let mut emitter = Emitter {
            mirror: &mut mirror,
            layout: &project_layout,
            files: &fx.files,
            items: &fx.items,
            registry: &fx.registry,
            types: &fx.types,
            symbolings: &layout.symbolings,
            prune: true,
            fill_history: FillHistory::new(),
        };
        emitter.run(layout.commits.iter().cloned().map(Ok)).unwrap();
        let ops = ops.borrow();
        assert!(!ops.contains(&"mkdir branches".to_string()));
        assert!(!ops.contains(&"mkdir tags".to_string()));
    }
}
