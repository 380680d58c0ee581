//! SVN commits: the scheduled changesets turned into a numbered revision
//! stream, together with the symboling records that layout discovers.

use anyhow::Result;
use itertools::Itertools;

use crate::changeset::Changeset;
use crate::changeset::ChangesetKind;
use crate::metadata::Metadata;
use crate::model::CvsItem;
use crate::model::CvsRevision;
use crate::model::FileId;
use crate::model::ItemId;
use crate::model::Lod;
use crate::model::RevOp;
use crate::model::SymbolId;
use crate::model::SymbolType;
use crate::store::RevisionMap;
use crate::symbolings::SymbolingsIndex;
use crate::symbolings::SymbolingsLogger;
use crate::symbols::SymbolRegistry;

#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub enum SvnCommitVariant {
    /// Revision 1: create the project skeleton.
    InitialProject,
    /// One CVS changeset.
    Primary { items: Vec<ItemId> },
    /// Fill a tag or branch by copying.
    SymbolFill { symbol: SymbolId, items: Vec<ItemId> },
    /// Reproduce non-trunk default-branch commits on trunk.
    PostCommit { motivating: u32, items: Vec<ItemId> },
}

#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct SvnCommit {
    pub revnum: u32,
    pub date: i64,
    pub author: Option<String>,
    pub log: String,
    pub variant: SvnCommitVariant,
}

/// Everything the layout of the revision stream produces.
pub struct CommitLayout {
    pub commits: Vec<SvnCommit>,
    pub revision_map: RevisionMap,
    pub symbolings: SymbolingsIndex,
}

/// Walk the scheduled changesets and assign revision numbers.
///
/// Revnum 1 is the project skeleton. Each revision changeset becomes a
/// primary commit; one with activity on a non-trunk default branch is
/// followed immediately by its post-commit. Symbol changesets become fills.
/// Openings and closings are logged as the numbers become known.
pub fn layout_commits(
    ordered: &[Changeset],
    items: &[CvsItem],
    metadata: &[Metadata],
    registry: &SymbolRegistry,
    types: &[SymbolType],
) -> Result<CommitLayout> {
    let mut layout = Layout {
        items,
        metadata,
        registry,
        types,
        commits: Vec::new(),
        revision_map: RevisionMap::new(items.len()),
        logger: SymbolingsLogger::new(),
        open_on_trunk: std::collections::HashMap::new(),
        next_revnum: 1,
        last_date: ordered
            .iter()
            .filter(|c| c.is_revision())
            .map(|c| c.t_min)
            .min()
            .unwrap_or(0),
    };

    layout.initial_project();
    for changeset in ordered {
        match changeset.kind {
            ChangesetKind::Revision => layout.primary(changeset)?,
            ChangesetKind::Branch(symbol) | ChangesetKind::Tag(symbol) => {
                layout.symbol_fill(symbol, changeset)
            }
        }
    }

    log::info!("laid out {} SVN revision(s)", layout.commits.len());
    Ok(CommitLayout {
        commits: layout.commits,
        revision_map: layout.revision_map,
        symbolings: layout.logger.seal(),
    })
}

struct Layout<'a> {
    items: &'a [CvsItem],
    metadata: &'a [Metadata],
    registry: &'a SymbolRegistry,
    types: &'a [SymbolType],
    commits: Vec<SvnCommit>,
    revision_map: RevisionMap,
    logger: SymbolingsLogger,
    /// Files whose trunk copy currently mirrors a default-branch revision,
    /// and the symbols openable from that trunk copy.
    open_on_trunk: std::collections::HashMap<FileId, Vec<SymbolId>>,
    next_revnum: u32,
    last_date: i64,
}

impl<'a> Layout<'a> {
    fn revision(&self, id: ItemId) -> &'a CvsRevision {
        self.items[id.index()].as_revision().expect("revision changesets hold revisions")
    }

    fn take_revnum(&mut self) -> u32 {
        let revnum = self.next_revnum;
        self.next_revnum += 1;
        revnum
    }

    fn included_symbols(&self, ids: &[SymbolId]) -> Vec<SymbolId> {
        ids.iter().copied().filter(|s| self.types[s.index()] != SymbolType::Excluded).collect()
    }

    fn initial_project(&mut self) {
        let revnum = self.take_revnum();
        self.commits.push(SvnCommit {
            revnum,
            date: self.last_date,
            author: None,
            log: "New repository initialized by cvs2svn.".to_string(),
            variant: SvnCommitVariant::InitialProject,
        });
    }

    fn primary(&mut self, changeset: &Changeset) -> Result<()> {
        let revnum = self.take_revnum();
        let date = changeset
            .items
            .iter()
            .map(|&id| self.revision(id).timestamp)
            .max()
            .unwrap_or(self.last_date);
        self.last_date = date;

        for &id in &changeset.items {
            let rev = self.revision(id);
            self.revision_map.set(id, revnum);

            for symbol in self.included_symbols(&rev.closed_symbols) {
                self.logger.log_closing(symbol, revnum, rev.lod, rev.file);
            }
            let sprouted: Vec<SymbolId> =
                self.included_symbols(&rev.sprouted_symbols().collect_vec());
            for &symbol in &sprouted {
                self.logger.log_opening(symbol, revnum, rev.lod, rev.file);
            }

            // A plain trunk commit supersedes whatever a default branch had
            // overlaid there.
            if rev.lod == Lod::Trunk {
                if let Some(symbols) = self.open_on_trunk.remove(&rev.file) {
                    for symbol in symbols {
                        self.logger.log_closing(symbol, revnum, Lod::Trunk, rev.file);
                    }
                }
            }
        }

        let metadata = &self.metadata[changeset.metadata.expect("revision changeset").index()];
        self.commits.push(SvnCommit {
            revnum,
            date,
            author: (!metadata.author.is_empty()).then(|| metadata.author.clone()),
            log: metadata.log.clone(),
            variant: SvnCommitVariant::Primary { items: changeset.items.clone() },
        });

        self.post_commit(changeset, revnum, date);
        Ok(())
    }

    /// Lay out the trunk sync for default-branch activity in `changeset`.
    fn post_commit(&mut self, changeset: &Changeset, motivating: u32, date: i64) {
        let sync_items: Vec<ItemId> = changeset
            .items
            .iter()
            .copied()
            .filter(|&id| {
                let rev = self.revision(id);
                // An import identical to 1.1 needs no trunk compensation.
                rev.default_branch_revision
                    && !(rev.op == RevOp::Add && !rev.deltatext_exists)
            })
            .collect();
        if sync_items.is_empty() {
            return;
        }

        let revnum = self.take_revnum();
        for &id in &sync_items {
            let rev = self.revision(id);
            if let Some(symbols) = self.open_on_trunk.remove(&rev.file) {
                for symbol in symbols {
                    self.logger.log_closing(symbol, revnum, Lod::Trunk, rev.file);
                }
            }
            if rev.op != RevOp::Delete {
                let sprouted = self.included_symbols(&rev.sprouted_symbols().collect_vec());
                for &symbol in &sprouted {
                    self.logger.log_opening(symbol, revnum, Lod::Trunk, rev.file);
                }
                if !sprouted.is_empty() {
                    self.open_on_trunk.insert(rev.file, sprouted);
                }
            }
        }

        self.commits.push(SvnCommit {
            revnum,
            date,
            author: None,
            log: format!(
                "This commit was generated by cvs2svn to compensate for changes in r{},\n\
                 which included commits to RCS files with non-trunk default branches.",
                motivating
            ),
            variant: SvnCommitVariant::PostCommit { motivating, items: sync_items },
        });
    }

    fn symbol_fill(&mut self, symbol: SymbolId, changeset: &Changeset) {
        let revnum = self.take_revnum();
        let name = &self.registry.get(symbol).name;
        let noun = match self.types[symbol.index()] {
            SymbolType::Branch => "branch",
            SymbolType::Tag => "tag",
            SymbolType::Excluded => unreachable!("excluded symbols have no changesets"),
        };
        self.commits.push(SvnCommit {
            revnum,
            date: self.last_date,
            author: None,
            log: format!("This commit was manufactured by cvs2svn to create {} '{}'.", noun, name),
            variant: SvnCommitVariant::SymbolFill { symbol, items: changeset.items.clone() },
        });
    }
}
