//! Per-symbol opening and closing records.
//!
//! While SVN commits are being laid out, every revision that is a copy
//! source for a symbol logs an opening, and the revision that supersedes it
//! logs a closing. Sorted by symbol, these records tell the fill planner
//! exactly which SVN revisions a symbol may be copied from, per file and per
//! source line of development.

use std::collections::HashMap;

use crate::model::FileId;
use crate::model::Lod;
use crate::model::SymbolId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(bincode::Encode, bincode::Decode)]
pub enum Side {
    Opening,
    Closing,
}

#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct SymbolingRecord {
    pub symbol: SymbolId,
    pub revnum: u32,
    pub side: Side,
    /// The line of development the copy source lives on.
    pub source_lod: Lod,
    pub file: FileId,
}

/// Accumulates records while commits are laid out; sealed into a
/// [SymbolingsIndex] once every primary commit has been processed.
#[derive(Debug, Default)]
pub struct SymbolingsLogger {
    records: Vec<SymbolingRecord>,
}

impl SymbolingsLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_opening(&mut self, symbol: SymbolId, revnum: u32, source_lod: Lod, file: FileId) {
        self.records.push(SymbolingRecord { symbol, revnum, side: Side::Opening, source_lod, file });
    }

    pub fn log_closing(&mut self, symbol: SymbolId, revnum: u32, source_lod: Lod, file: FileId) {
        self.records.push(SymbolingRecord { symbol, revnum, side: Side::Closing, source_lod, file });
    }

    pub fn seal(mut self) -> SymbolingsIndex {
        self.records.sort_by_key(|r| (r.symbol, r.revnum, r.file));
        let mut ranges: HashMap<SymbolId, (u32, u32)> = HashMap::new();
        for (i, record) in self.records.iter().enumerate() {
            let entry = ranges.entry(record.symbol).or_insert((i as u32, i as u32));
            entry.1 = i as u32 + 1;
        }
        SymbolingsIndex { records: self.records, ranges }
    }
}

/// The range of SVN revisions a file can be copied from for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvnRevisionRange {
    pub opening: u32,
    /// First revision past the last valid source; open-ended when absent.
    pub closing: Option<u32>,
}

impl SvnRevisionRange {
    pub fn covers(&self, revnum: u32) -> bool {
        self.opening <= revnum && self.closing.map_or(true, |c| revnum < c)
    }
}

/// One copy source for a fill: a file, the LOD to copy it from, and the
/// revisions at which that copy is valid.
#[derive(Debug, Clone)]
pub struct SymbolSource {
    pub file: FileId,
    pub source_lod: Lod,
    pub range: SvnRevisionRange,
}

/// Sorted symboling records with a per-symbol offset index.
#[derive(Debug, Default)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct SymbolingsIndex {
    records: Vec<SymbolingRecord>,
    ranges: HashMap<SymbolId, (u32, u32)>,
}

impl SymbolingsIndex {
    fn slice(&self, symbol: SymbolId) -> &[SymbolingRecord] {
        match self.ranges.get(&symbol) {
            Some(&(start, end)) => &self.records[start as usize..end as usize],
            None => &[],
        }
    }

    /// Compute the copy sources for filling `symbol` at `fill_revnum`,
    /// optionally restricted to the given files (secondary fills).
    ///
    /// Per (file, source LOD) the latest opening before the fill wins, with
    /// its first subsequent closing.
    pub fn sources(
        &self,
        symbol: SymbolId,
        fill_revnum: u32,
        files: Option<&std::collections::HashSet<FileId>>,
    ) -> Vec<SymbolSource> {
        let mut current: HashMap<(FileId, Lod), SvnRevisionRange> = HashMap::new();
        for record in self.slice(symbol) {
            if record.revnum >= fill_revnum {
                // Later fills of the same symbol will see these.
                if record.side == Side::Closing {
                    if let Some(range) = current.get_mut(&(record.file, record.source_lod)) {
                        if range.closing.is_none() {
                            range.closing = Some(record.revnum);
                        }
                    }
                }
                continue;
            }
            if files.is_some_and(|f| !f.contains(&record.file)) {
                continue;
            }
            let key = (record.file, record.source_lod);
            match record.side {
                Side::Opening => {
                    current.insert(key, SvnRevisionRange { opening: record.revnum, closing: None });
                }
                Side::Closing => {
                    if let Some(range) = current.get_mut(&key) {
                        if range.closing.is_none() {
                            range.closing = Some(record.revnum);
                        }
                    }
                }
            }
        }

        let mut sources: Vec<SymbolSource> = current
            .into_iter()
            .map(|((file, source_lod), range)| SymbolSource { file, source_lod, range })
            .collect();
        sources.sort_by_key(|s| (s.file, s.source_lod));
        sources
    }
}
