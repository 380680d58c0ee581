//! The entities shared by every pass of the conversion.

use std::fmt::Display;

use crate::rcs::RevNum;

macro_rules! id_type {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[derive(bincode::Encode, bincode::Decode)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

id_type!(FileId, "f");
id_type!(ItemId, "i");
id_type!(SymbolId, "s");
id_type!(MetadataId, "m");
id_type!(ChangesetId, "c");

/// What a CVS revision does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display)]
#[derive(bincode::Encode, bincode::Decode)]
#[strum(serialize_all = "lowercase")]
pub enum RevOp {
    Add,
    Change,
    Delete,
    Noop,
}

/// A line of development: trunk or a named branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(bincode::Encode, bincode::Decode)]
pub enum Lod {
    Trunk,
    Branch(SymbolId),
}

impl Lod {
    pub fn branch_id(self) -> Option<SymbolId> {
        match self {
            Lod::Trunk => None,
            Lod::Branch(id) => Some(id),
        }
    }
}

/// One RCS file of the CVS repository. Immutable after collection.
#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct CvsFile {
    pub id: FileId,
    /// Absolute path of the `,v` file on disk.
    pub rcs_path: String,
    /// Project-relative path used on the SVN side, `Attic/` stripped.
    pub svn_path: String,
    pub executable: bool,
    pub size: u64,
    pub in_attic: bool,
}

/// A single revision of a [CvsFile].
#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct CvsRevision {
    pub id: ItemId,
    pub file: FileId,
    pub rev: RevNum,
    pub timestamp: i64,
    pub metadata: MetadataId,
    pub op: RevOp,
    /// Adjacent revisions on the same line of development.
    pub prev: Option<ItemId>,
    pub next: Option<ItemId>,
    pub lod: Lod,
    /// Branches sprouting from this revision.
    pub branches: Vec<SymbolId>,
    /// Tags attached to this revision.
    pub tags: Vec<SymbolId>,
    /// Symbols whose last valid copy source is the revision before this one.
    pub closed_symbols: Vec<SymbolId>,
    pub default_branch_revision: bool,
    pub deltatext_exists: bool,
    pub first_on_branch: bool,
}

impl CvsRevision {
    pub fn sprouted_symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.branches.iter().chain(self.tags.iter()).copied()
    }
}

/// A per-file occurrence of a tag or branch, pointing at its source revision.
#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct CvsSymbol {
    pub id: ItemId,
    pub symbol: SymbolId,
    pub file: FileId,
    pub source: ItemId,
}

/// Either kind of per-file item; revisions and symbol occurrences share one
/// id space so changesets can hold both.
#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub enum CvsItem {
    Revision(CvsRevision),
    Symbol(CvsSymbol),
}

impl CvsItem {
    pub fn id(&self) -> ItemId {
        match self {
            CvsItem::Revision(r) => r.id,
            CvsItem::Symbol(s) => s.id,
        }
    }

    pub fn as_revision(&self) -> Option<&CvsRevision> {
        match self {
            CvsItem::Revision(r) => Some(r),
            CvsItem::Symbol(_) => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&CvsSymbol> {
        match self {
            CvsItem::Revision(_) => None,
            CvsItem::Symbol(s) => Some(s),
        }
    }
}

/// A project-wide symbolic name.
#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct Symbol {
    pub id: SymbolId,
    pub name: String,
    /// The name scrubbed into a valid SVN path component.
    pub cleaned_name: String,
}

/// What a symbol becomes on the SVN side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display)]
#[derive(bincode::Encode, bincode::Decode)]
#[strum(serialize_all = "lowercase")]
pub enum SymbolType {
    Branch,
    Tag,
    Excluded,
}
