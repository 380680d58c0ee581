//! The collection pass: turn parsed RCS histories into the item stores and
//! symbol statistics every later pass works from.

use std::collections::BTreeMap;
use std::collections::HashMap;

use anyhow::Context as _;
use anyhow::Result;

use crate::metadata::Decoder;
use crate::metadata::MetadataInterner;
use crate::model::CvsFile;
use crate::model::CvsItem;
use crate::model::CvsRevision;
use crate::model::CvsSymbol;
use crate::model::FileId;
use crate::model::ItemId;
use crate::model::Lod;
use crate::model::RevOp;
use crate::model::SymbolId;
use crate::project::clean_symbol_name;
use crate::project::transform_symbol_name;
use crate::project::DiscoveredFile;
use crate::project::SymbolTransform;
use crate::rcs::RevNum;
use crate::rlog::ParsedRcsFile;
use crate::rlog::ParsedRevision;
use crate::rlog::RecordSource;
use crate::symbols::SymbolRegistry;

pub struct Collector<'a> {
    pub source: &'a mut dyn RecordSource,
    pub decoder: &'a Decoder,
    pub transforms: &'a [SymbolTransform],
    pub registry: SymbolRegistry,
    pub metadata: MetadataInterner,
    pub files: Vec<CvsFile>,
    pub items: Vec<CvsItem>,
}

impl<'a> Collector<'a> {
    pub fn new(
        source: &'a mut dyn RecordSource,
        decoder: &'a Decoder,
        transforms: &'a [SymbolTransform],
    ) -> Self {
        Self {
            source,
            decoder,
            transforms,
            registry: SymbolRegistry::new(),
            metadata: MetadataInterner::new(),
            files: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn collect_file(&mut self, discovered: &DiscoveredFile) -> Result<()> {
        let file_id = FileId(self.files.len() as u32);
        let parsed = self
            .source
            .read(&discovered.rcs_path)
            .with_context(|| format!("while collecting {}", discovered.svn_path))?;

        self.files.push(CvsFile {
            id: file_id,
            rcs_path: discovered.rcs_path.to_string_lossy().into_owned(),
            svn_path: discovered.svn_path.clone(),
            executable: discovered.executable,
            size: discovered.size,
            in_attic: discovered.in_attic,
        });

        let items = FileGraph::build(self, file_id, &parsed, &discovered.svn_path)?;
        self.items.extend(items);
        Ok(())
    }

    fn next_item_id(&self) -> ItemId {
        ItemId(self.items.len() as u32)
    }
}

/// The per-file revision graph under construction.
struct FileGraph {
    file: FileId,
    revisions: Vec<CvsRevision>,
    symbols: Vec<CvsSymbol>,
}

impl FileGraph {
    fn build(
        collector: &mut Collector,
        file: FileId,
        parsed: &ParsedRcsFile,
        svn_path: &str,
    ) -> Result<Vec<CvsItem>> {
        // Resolve symbolic names into branch and tag usages.
        let mut branch_symbols: BTreeMap<RevNum, SymbolId> = BTreeMap::new();
        let mut tag_usages: Vec<(SymbolId, RevNum)> = Vec::new();
        for (name, num) in &parsed.symbols {
            let renamed = transform_symbol_name(collector.transforms, name);
            let cleaned = clean_symbol_name(&renamed);
            let id = collector.registry.intern(&renamed, cleaned);
            if num.is_branch() {
                let branch = num.to_branch()?;
                match branch_symbols.get(&branch) {
                    Some(&existing) => log::warn!(
                        "{}: symbol {:?} is an alias of {:?}; ignored",
                        svn_path,
                        name,
                        collector.registry.get(existing).name
                    ),
                    None => {
                        branch_symbols.insert(branch, id);
                        collector.registry.note_branch(id);
                    }
                }
            } else {
                tag_usages.push((id, num.clone()));
                collector.registry.note_tag(id);
            }
        }

        // Group revisions into their lines of development.
        let mut trunk: Vec<&ParsedRevision> = Vec::new();
        let mut branches: BTreeMap<RevNum, Vec<&ParsedRevision>> = BTreeMap::new();
        for revision in &parsed.revisions {
            if revision.rev.is_trunk_revision() {
                trunk.push(revision);
            } else if let Some(branch) = revision.rev.branch() {
                if branch_symbols.contains_key(&branch) {
                    branches.entry(branch).or_default().push(revision);
                } else {
                    log::warn!(
                        "{}: revision {} is on an unnamed branch; ignored",
                        svn_path,
                        revision.rev
                    );
                }
            }
        }
        trunk.sort_by(|a, b| a.rev.cmp(&b.rev));
        for chain in branches.values_mut() {
            chain.sort_by(|a, b| a.rev.cmp(&b.rev));
        }

        let mut graph = FileGraph { file, revisions: Vec::new(), symbols: Vec::new() };
        let base_id = collector.next_item_id();
        let mut index_of: HashMap<RevNum, usize> = HashMap::new();

        // Trunk chain first, then each branch chain sprouting from it.
        graph.add_chain(collector, &trunk, Lod::Trunk, None, &mut index_of, base_id, parsed, svn_path)?;
        for (branch, chain) in &branches {
            let symbol = branch_symbols[branch];
            let sprout = branch.sprouts_from()?;
            let sprout_index = index_of.get(&sprout).copied();
            if sprout_index.is_none() {
                log::warn!(
                    "{}: branch {:?} sprouts from missing revision {}; ignored",
                    svn_path,
                    collector.registry.get(symbol).name,
                    sprout
                );
                continue;
            }
            graph.add_chain(
                collector,
                chain,
                Lod::Branch(symbol),
                sprout_index,
                &mut index_of,
                base_id,
                parsed,
                svn_path,
            )?;
            if !chain.is_empty() {
                collector.registry.note_branch_commit(symbol);
            }
        }

        // Attach symbol sprouts: branches at their sprout revision, tags at
        // the tagged revision.
        for (branch, &symbol) in &branch_symbols {
            let sprout = branch.sprouts_from()?;
            graph.attach_symbol(collector, symbol, &sprout, true, &index_of, base_id, svn_path);
        }
        for (symbol, rev) in &tag_usages {
            graph.attach_symbol(collector, *symbol, rev, false, &index_of, base_id, svn_path);
        }

        // A revision closes the symbols sprouting from its predecessor.
        for i in 0..graph.revisions.len() {
            let sprouted: Vec<SymbolId> = graph.revisions[i].sprouted_symbols().collect();
            if sprouted.is_empty() {
                continue;
            }
            if let Some(next) = graph.revisions[i].next {
                let next_index = (next.0 - base_id.0) as usize;
                graph.revisions[next_index].closed_symbols.extend(sprouted);
            }
        }

        let mut items: Vec<CvsItem> = graph.revisions.into_iter().map(CvsItem::Revision).collect();
        items.extend(graph.symbols.into_iter().map(CvsItem::Symbol));
        items.sort_by_key(|i| i.id());
        Ok(items)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_chain(
        &mut self,
        collector: &mut Collector,
        chain: &[&ParsedRevision],
        lod: Lod,
        sprout_index: Option<usize>,
        index_of: &mut HashMap<RevNum, usize>,
        base_id: ItemId,
        parsed: &ParsedRcsFile,
        svn_path: &str,
    ) -> Result<()> {
        let lod_name = match lod {
            Lod::Trunk => String::new(),
            Lod::Branch(id) => collector.registry.get(id).name.clone(),
        };
        let default_branch = parsed
            .default_branch
            .as_ref()
            .and_then(|b| b.to_branch().ok());

        let mut prev_index = sprout_index;
        for (position, revision) in chain.iter().enumerate() {
            let index = self.revisions.len();
            let id = ItemId(base_id.0 + index as u32);

            let prev_dead = prev_index
                .map(|i| self.revisions[i].op == RevOp::Delete || self.revisions[i].op == RevOp::Noop);
            let op = if revision.dead {
                match prev_dead {
                    // CVS cannot produce a delete after a delete; treat it
                    // as if the revision were not there.
                    Some(true) => RevOp::Noop,
                    _ => RevOp::Delete,
                }
            } else {
                match prev_dead {
                    None | Some(true) => RevOp::Add,
                    Some(false) => RevOp::Change,
                }
            };

            // CVS timestamps go backwards often enough to matter; nudge them
            // forward so each line of development stays monotonic.
            let mut timestamp = revision.timestamp;
            if let Some(i) = prev_index {
                if timestamp <= self.revisions[i].timestamp {
                    log::debug!(
                        "{}: timestamp of {} adjusted to follow {}",
                        svn_path,
                        revision.rev,
                        self.revisions[i].rev
                    );
                    timestamp = self.revisions[i].timestamp + 1;
                }
            }

            let first_on_branch = lod != Lod::Trunk && position == 0;
            let author = collector.decoder.decode(&revision.author);
            let log_msg = collector.decoder.decode(&revision.log);
            let metadata = collector.metadata.intern(author, log_msg, lod_name.clone());

            let deltatext_exists = !(revision.rev.components() == [1, 1, 1, 1]
                && revision.lines.map_or(true, |l| l == (0, 0)));

            self.revisions.push(CvsRevision {
                id,
                file: self.file,
                rev: revision.rev.clone(),
                timestamp,
                metadata,
                op,
                prev: prev_index.map(|i| ItemId(base_id.0 + i as u32)),
                next: None,
                lod,
                branches: Vec::new(),
                tags: Vec::new(),
                closed_symbols: Vec::new(),
                default_branch_revision: default_branch
                    .as_ref()
                    .is_some_and(|b| revision.rev.branch().as_ref() == Some(b)),
                deltatext_exists,
                first_on_branch,
            });

            // Only link "next" along the same line of development.
            if let Some(i) = prev_index {
                if self.revisions[i].lod == lod {
                    self.revisions[i].next = Some(id);
                }
            }
            index_of.insert(revision.rev.clone(), index);
            prev_index = Some(index);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_symbol(
        &mut self,
        collector: &mut Collector,
        symbol: SymbolId,
        source_rev: &RevNum,
        is_branch: bool,
        index_of: &HashMap<RevNum, usize>,
        base_id: ItemId,
        svn_path: &str,
    ) {
        let Some(&source_index) = index_of.get(source_rev) else {
            log::warn!(
                "{}: symbol {:?} points at missing revision {}; ignored",
                svn_path,
                collector.registry.get(symbol).name,
                source_rev
            );
            return;
        };

        let source = &mut self.revisions[source_index];
        if is_branch {
            source.branches.push(symbol);
        } else {
            source.tags.push(symbol);
        }
        let source_id = source.id;
        if let Lod::Branch(on_branch) = source.lod {
            collector.registry.note_blocker(on_branch, symbol);
        }

        let id = ItemId(base_id.0 + (self.revisions.len() + self.symbols.len()) as u32);
        self.symbols.push(CvsSymbol { id, symbol, file: self.file, source: source_id });
    }
}
