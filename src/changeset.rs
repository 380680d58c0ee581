//! Changesets: the groups of per-file items that become SVN revisions.

use crate::model::ChangesetId;
use crate::model::ItemId;
use crate::model::MetadataId;
use crate::model::SymbolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(bincode::Encode, bincode::Decode)]
pub enum ChangesetKind {
    /// CVS revisions sharing metadata within a time window.
    Revision,
    /// The creation and filling of a branch.
    Branch(SymbolId),
    /// The filling of a tag.
    Tag(SymbolId),
}

#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct Changeset {
    pub id: ChangesetId,
    pub kind: ChangesetKind,
    pub items: Vec<ItemId>,
    pub t_min: i64,
    pub t_max: i64,
    /// Present on revision changesets only.
    pub metadata: Option<MetadataId>,
}

impl Changeset {
    pub fn is_revision(&self) -> bool {
        self.kind == ChangesetKind::Revision
    }

    pub fn symbol(&self) -> Option<SymbolId> {
        match self.kind {
            ChangesetKind::Revision => None,
            ChangesetKind::Branch(s) | ChangesetKind::Tag(s) => Some(s),
        }
    }
}
