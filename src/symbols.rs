//! Symbol statistics and the tag/branch/exclude strategy.

use std::collections::BTreeSet;
use std::collections::HashMap;

use anyhow::bail;
use anyhow::Result;
use regex::Regex;

use crate::model::Symbol;
use crate::model::SymbolId;
use crate::model::SymbolType;

/// Per-symbol observation counts accumulated during collection.
#[derive(Debug, Clone, Default)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct SymbolStats {
    /// Files where the symbol appears as a tag.
    pub tag_files: u32,
    /// Files where the symbol appears as a branch.
    pub branch_files: u32,
    /// Files with commits on the symbol's branch.
    pub branch_commits: u32,
    /// Symbols that sprout from this symbol's branch.
    pub blockers: BTreeSet<SymbolId>,
}

/// All project-wide symbols, their stats, and the name lookup.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    symbols: Vec<Symbol>,
    stats: Vec<SymbolStats>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split into the persistable tables. The name lookup is rebuilt by
    /// [SymbolRegistry::from_parts].
    pub fn into_parts(self) -> (Vec<Symbol>, Vec<SymbolStats>) {
        (self.symbols, self.stats)
    }

    pub fn from_parts(symbols: Vec<Symbol>, stats: Vec<SymbolStats>) -> Self {
        let by_name = symbols.iter().map(|s| (s.name.clone(), s.id)).collect();
        Self { symbols, stats, by_name }
    }

    pub fn intern(&mut self, name: &str, cleaned_name: String) -> SymbolId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol { id, name: name.to_string(), cleaned_name });
        self.stats.push(SymbolStats::default());
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub fn stats(&self, id: SymbolId) -> &SymbolStats {
        &self.stats[id.index()]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn note_tag(&mut self, id: SymbolId) {
        self.stats[id.index()].tag_files += 1;
    }

    pub fn note_branch(&mut self, id: SymbolId) {
        self.stats[id.index()].branch_files += 1;
    }

    pub fn note_branch_commit(&mut self, id: SymbolId) {
        self.stats[id.index()].branch_commits += 1;
    }

    pub fn note_blocker(&mut self, id: SymbolId, blocker: SymbolId) {
        self.stats[id.index()].blockers.insert(blocker);
    }
}

/// One `--exclude`/`--force-branch`/`--force-tag` rule. Rules are applied in
/// the order given on the command line; the first whole-name match wins.
#[derive(Debug, Clone)]
pub enum StrategyRule {
    Exclude(Regex),
    ForceBranch(Regex),
    ForceTag(Regex),
}

impl StrategyRule {
    pub fn compile(kind: &str, pattern: &str) -> Result<Regex> {
        match Regex::new(&format!("^(?:{})$", pattern)) {
            Ok(regex) => Ok(regex),
            Err(e) => bail!("invalid {} pattern {:?}: {}", kind, pattern, e),
        }
    }

    fn matches(&self, name: &str) -> Option<SymbolType> {
        match self {
            StrategyRule::Exclude(r) if r.is_match(name) => Some(SymbolType::Excluded),
            StrategyRule::ForceBranch(r) if r.is_match(name) => Some(SymbolType::Branch),
            StrategyRule::ForceTag(r) if r.is_match(name) => Some(SymbolType::Tag),
            _ => None,
        }
    }
}

/// Classify one symbol. User rules take precedence; absent a forced choice a
/// symbol that ever appeared as a branch becomes a branch, otherwise a tag.
pub fn classify(symbol: &Symbol, stats: &SymbolStats, rules: &[StrategyRule]) -> SymbolType {
    for rule in rules {
        if let Some(symbol_type) = rule.matches(&symbol.name) {
            return symbol_type;
        }
    }
    if stats.branch_files > 0 {
        SymbolType::Branch
    } else {
        SymbolType::Tag
    }
}

fn is_forced(symbol: &Symbol, rules: &[StrategyRule]) -> bool {
    rules.iter().any(|r| r.matches(&symbol.name).is_some())
}

/// Classify every symbol and run the consistency checks.
///
/// All problems are collected before failing so the user sees the complete
/// list in one run. With `trunk_only` every symbol is excluded and no checks
/// run.
pub fn classify_all(
    registry: &SymbolRegistry,
    rules: &[StrategyRule],
    trunk_only: bool,
) -> Result<Vec<SymbolType>> {
    if trunk_only {
        return Ok(vec![SymbolType::Excluded; registry.len()]);
    }

    let mut types = Vec::with_capacity(registry.len());
    let mut problems = Vec::new();

    for symbol in registry.iter() {
        let stats = registry.stats(symbol.id);
        let symbol_type = classify(symbol, stats, rules);

        if stats.tag_files > 0 && stats.branch_files > 0 && !is_forced(symbol, rules) {
            problems.push(format!(
                "symbol {:?} is a tag in {} file(s) and a branch in {} file(s); \
                 use --force-branch, --force-tag or --exclude to resolve",
                symbol.name, stats.tag_files, stats.branch_files
            ));
        }
        if symbol_type == SymbolType::Tag && stats.branch_commits > 0 {
            problems.push(format!(
                "symbol {:?} cannot be converted as a tag because {} file(s) have commits on it",
                symbol.name, stats.branch_commits
            ));
        }
        types.push(symbol_type);
    }

    for symbol in registry.iter() {
        if types[symbol.id.index()] != SymbolType::Excluded {
            continue;
        }
        let blocked: Vec<&str> = registry
            .stats(symbol.id)
            .blockers
            .iter()
            .filter(|b| types[b.index()] != SymbolType::Excluded)
            .map(|b| registry.get(*b).name.as_str())
            .collect();
        if !blocked.is_empty() {
            problems.push(format!(
                "symbol {:?} cannot be excluded: {} sprout(s) from it",
                symbol.name,
                blocked.join(", ")
            ));
        }
    }

    if !problems.is_empty() {
        bail!("symbol strategy problems:\n  {}", problems.join("\n  "));
    }

    let branches = types.iter().filter(|t| **t == SymbolType::Branch).count();
    let tags = types.iter().filter(|t| **t == SymbolType::Tag).count();
    let excluded = types.iter().filter(|t| **t == SymbolType::Excluded).count();
    log::info!("symbols: {} branch(es), {} tag(s), {} excluded", branches, tags, excluded);
    Ok(types)
}
