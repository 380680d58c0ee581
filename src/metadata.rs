//! Interning of (author, log, branch) commit metadata.
//!
//! Revisions sharing a [MetadataId] are eligible to land in the same
//! changeset. Author and log arrive from rlog as raw bytes and are decoded
//! here against the configured encoding list.

use std::collections::HashMap;

use anyhow::bail;
use anyhow::Result;
use encoding_rs::Encoding;

use crate::model::MetadataId;

#[derive(Debug, Clone)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct Metadata {
    pub author: String,
    pub log: String,
}

/// Write-once interner; the sealed record vec is what later passes read.
#[derive(Debug, Default)]
pub struct MetadataInterner {
    records: Vec<Metadata>,
    lookup: HashMap<(String, String, String), MetadataId>,
}

impl MetadataInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an (author, log, branch-name) triple. The branch name keeps
    /// same-author same-log commits on different branches apart.
    pub fn intern(&mut self, author: String, log: String, branch: String) -> MetadataId {
        let key = (author, log, branch);
        if let Some(&id) = self.lookup.get(&key) {
            return id;
        }
        let id = MetadataId(self.records.len() as u32);
        self.records.push(Metadata { author: key.0.clone(), log: key.1.clone() });
        self.lookup.insert(key, id);
        id
    }

    pub fn into_records(self) -> Vec<Metadata> {
        self.records
    }
}

/// Decode bytes against each encoding in order, then the fallback.
///
/// A decode that needed the fallback (or lossy replacement) logs a warning
/// naming the offending text.
pub struct Decoder {
    encodings: Vec<&'static Encoding>,
    fallback: Option<&'static Encoding>,
}

impl Decoder {
    pub fn new(labels: &[String], fallback: Option<&str>) -> Result<Self> {
        let mut encodings = Vec::new();
        for label in labels {
            match Encoding::for_label(label.as_bytes()) {
                Some(e) => encodings.push(e),
                None => bail!("unknown encoding: {:?}", label),
            }
        }
        if encodings.is_empty() {
            encodings.push(encoding_rs::UTF_8);
        }
        let fallback = match fallback {
            Some(label) => match Encoding::for_label(label.as_bytes()) {
                Some(e) => Some(e),
                None => bail!("unknown fallback encoding: {:?}", label),
            },
            None => None,
        };
        Ok(Self { encodings, fallback })
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        for encoding in &self.encodings {
            let (text, _, malformed) = encoding.decode(bytes);
            if !malformed {
                return text.into_owned();
            }
        }
        if let Some(fallback) = self.fallback {
            let (text, _, _) = fallback.decode(bytes);
            log::warn!(
                "text could not be decoded with the configured encodings; \
                 used fallback {}: {:?}",
                fallback.name(),
                text
            );
            return text.into_owned();
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        log::warn!("text could not be decoded; kept lossy form: {:?}", text);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut interner = MetadataInterner::new();
        let a = interner.intern("jrandom".into(), "fix".into(), "".into());
        let b = interner.intern("jrandom".into(), "fix".into(), "".into());
        let c = interner.intern("jrandom".into(), "fix".into(), "B1".into());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.into_records().len(), 2);
    }

    #[test]
    fn decodes_with_first_matching_encoding() {
        let decoder = Decoder::new(&["utf-8".into(), "latin1".into()], None).unwrap();
        assert_eq!(decoder.decode("héllo".as_bytes()), "héllo");
        // 0xE9 is not valid UTF-8 but is 'é' in latin1.
        assert_eq!(decoder.decode(&[0x68, 0xE9]), "hé");
    }

    #[test]
    fn unknown_encoding_is_an_error() {
        assert!(Decoder::new(&["no-such-encoding".into()], None).is_err());
    }
}
