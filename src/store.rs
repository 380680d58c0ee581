//! On-disk stores for the artifacts passed between passes.
//!
//! Every store has two lifecycles: written once and sealed by the pass that
//! produces it, then opened read-only by later passes. Records are encoded
//! with bincode; random-access stores keep an id -> offset table beside the
//! record blob.

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;

use crate::model::ItemId;
use crate::model::SymbolId;

static BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

/// Encode a whole value into a file.
pub fn save<T: bincode::Encode, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let bytes = bincode::encode_to_vec(value, BINCODE_CONFIG)?;
    std::fs::write(path.as_ref(), bytes)
        .with_context(|| format!("could not write {}", path.as_ref().display()))?;
    Ok(())
}

/// Decode a whole value from a file written by [save].
pub fn load<T: bincode::Decode<()>, P: AsRef<Path>>(path: P) -> Result<T> {
    let bytes = std::fs::read(path.as_ref())
        .with_context(|| format!("could not read {}", path.as_ref().display()))?;
    let (value, _) = bincode::decode_from_slice(&bytes, BINCODE_CONFIG)?;
    Ok(value)
}

fn offsets_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".idx");
    path.with_file_name(name)
}

/// The write lifecycle of an indexed record store.
pub struct RecordWriter<T> {
    out: BufWriter<File>,
    offsets: Vec<u64>,
    written: u64,
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: bincode::Encode> RecordWriter<T> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("could not create {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            offsets: Vec::new(),
            written: 0,
            path,
            _marker: PhantomData,
        })
    }

    /// Append one record, returning its index.
    pub fn append(&mut self, record: &T) -> Result<u32> {
        let id = self.offsets.len() as u32;
        self.offsets.push(self.written);
        let bytes = bincode::encode_to_vec(record, BINCODE_CONFIG)?;
        self.out.write_all(&bytes)?;
        self.written += bytes.len() as u64;
        Ok(id)
    }

    /// Flush the blob and write the offset table; the store is now readable.
    pub fn seal(mut self) -> Result<()> {
        self.out.flush()?;
        save(offsets_path(&self.path), &self.offsets)
    }
}

/// The read lifecycle of an indexed record store.
pub struct RecordReader<T> {
    data: Vec<u8>,
    offsets: Vec<u64>,
    _marker: PhantomData<T>,
}

impl<T: bincode::Decode<()>> RecordReader<T> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let offsets = load(offsets_path(path))?;
        Ok(Self { data, offsets, _marker: PhantomData })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn get(&self, index: usize) -> Result<T> {
        let start = *self
            .offsets
            .get(index)
            .with_context(|| format!("record {} out of range", index))? as usize;
        let end = self.offsets.get(index + 1).map_or(self.data.len(), |&o| o as usize);
        let (value, _) = bincode::decode_from_slice(&self.data[start..end], BINCODE_CONFIG)?;
        Ok(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<T>> + '_ {
        (0..self.len()).map(|i| self.get(i))
    }
}

/// Dense CVS item id -> SVN revision number map. Items that do not reach the
/// SVN side (excluded branches) stay at zero, which is never a valid revnum.
#[derive(Debug, Default)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct RevisionMap {
    revnums: Vec<u32>,
}

impl RevisionMap {
    pub fn new(item_count: usize) -> Self {
        Self { revnums: vec![0; item_count] }
    }

    pub fn set(&mut self, item: ItemId, revnum: u32) {
        self.revnums[item.index()] = revnum;
    }

    pub fn get(&self, item: ItemId) -> Option<u32> {
        match self.revnums.get(item.index()) {
            Some(0) | None => None,
            Some(&revnum) => Some(revnum),
        }
    }
}

/// For each symbol, the SVN revisions in which it was filled.
#[derive(Debug, Default)]
pub struct FillHistory {
    fills: std::collections::HashMap<SymbolId, Vec<u32>>,
}

impl FillHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills happen in revnum order, so the per-symbol list stays sorted.
    pub fn record(&mut self, symbol: SymbolId, revnum: u32) {
        let fills = self.fills.entry(symbol).or_default();
        debug_assert!(fills.last().map_or(true, |&last| last < revnum));
        fills.push(revnum);
    }

    pub fn last_filled(&self, symbol: SymbolId) -> Option<u32> {
        self.fills.get(&symbol).and_then(|f| f.last()).copied()
    }

    pub fn filled_since(&self, symbol: SymbolId, revnum: u32) -> bool {
        match self.fills.get(&symbol) {
            Some(fills) => match fills.binary_search(&revnum) {
                Ok(i) | Err(i) => i < fills.len(),
            },
            None => false,
        }
    }
}
