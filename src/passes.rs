//! The conversion as an ordered sequence of passes over on-disk artifacts.
//!
//! Each pass reads stores sealed by earlier passes and seals its own; no
//! pass mutates an earlier pass's output. This keeps each stage restartable
//! during development and the data flow auditable.

use std::io::BufWriter;
use std::time::Instant;

use anyhow::Context as _;
use anyhow::Result;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use itertools::Itertools;

use crate::aggregate::build_symbol_changesets;
use crate::aggregate::ChangesetBuilder;
use crate::changeset::Changeset;
use crate::collect::Collector;
use crate::commit::layout_commits;
use crate::commit::SvnCommit;
use crate::context::Context;
use crate::dump::CoContentReader;
use crate::dump::DumpfileWriter;
use crate::dump::SvnRepositoryLoader;
use crate::emit::Emitter;
use crate::metadata::Decoder;
use crate::metadata::Metadata;
use crate::mirror::Mirror;
use crate::model::CvsFile;
use crate::model::CvsItem;
use crate::model::CvsRevision;
use crate::model::Lod;
use crate::model::Symbol;
use crate::model::SymbolType;
use crate::project::Project;
use crate::rlog::RlogSource;
use crate::schedule::Scheduler;
use crate::store;
use crate::store::FillHistory;
use crate::store::RecordReader;
use crate::store::RecordWriter;
use crate::symbolings::SymbolingsIndex;
use crate::symbols::classify_all;
use crate::symbols::SymbolRegistry;
use crate::symbols::SymbolStats;

pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &Context) -> Result<()>;
}

pub fn run_passes(ctx: &Context, passes: &[&dyn Pass]) -> Result<()> {
    let started = Instant::now();
    for (number, pass) in passes.iter().enumerate() {
        log::info!("----- pass {} ({}) -----", number + 1, pass.name());
        let pass_started = Instant::now();
        pass.run(ctx).with_context(|| format!("pass {} ({})", number + 1, pass.name()))?;
        log::info!("pass {} finished in {}ms", number + 1, pass_started.elapsed().as_millis());
    }
    log::info!("conversion finished in {}ms", started.elapsed().as_millis());
    Ok(())
}

fn progress_bar(ctx: &Context, len: usize) -> ProgressBar {
    let bar = ctx.progress.add(ProgressBar::new(len as u64));
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
            .expect("static template"),
    );
    bar
}

fn load_registry(ctx: &Context) -> Result<SymbolRegistry> {
    let (symbols, stats): (Vec<Symbol>, Vec<SymbolStats>) =
        store::load(ctx.artifacts.path("symbols"))?;
    Ok(SymbolRegistry::from_parts(symbols, stats))
}

fn load_items(ctx: &Context, name: &str) -> Result<Vec<CvsItem>> {
    let reader: RecordReader<CvsItem> = RecordReader::open(ctx.artifacts.path(name))?;
    reader.iter().collect()
}

fn write_items(ctx: &Context, name: &str, items: &[CvsItem]) -> Result<()> {
    let mut writer = RecordWriter::create(ctx.artifacts.path(name))?;
    for item in items {
        writer.append(item)?;
    }
    writer.seal()
}

/// Pass 1: read every RCS file's history and build the raw item stores.
pub struct CollectPass;

impl Pass for CollectPass {
    fn name(&self) -> &'static str {
        "collect"
    }

    fn run(&self, ctx: &Context) -> Result<()> {
        let project = Project::open(&ctx.config.cvs_path)?;
        let discovered = project.discover_files()?;
        let decoder =
            Decoder::new(&ctx.config.encodings, ctx.config.fallback_encoding.as_deref())?;
        let mut source = RlogSource::default();
        let mut collector = Collector::new(&mut source, &decoder, &ctx.config.symbol_transforms);

        let bar = progress_bar(ctx, discovered.len());
        for file in &discovered {
            bar.set_message(file.svn_path.clone());
            collector.collect_file(file)?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        ctx.progress.remove(&bar);

        let Collector { registry, metadata, files, items, .. } = collector;
        log::info!(
            "collected {} file(s), {} item(s), {} symbol(s)",
            files.len(),
            items.len(),
            registry.len()
        );
        store::save(ctx.artifacts.path("cvs-files"), &files)?;
        write_items(ctx, "cvs-items", &items)?;
        store::save(ctx.artifacts.path("symbols"), &registry.into_parts())?;
        store::save(ctx.artifacts.path("metadata"), &metadata.into_records())?;
        Ok(())
    }
}

/// Pass 2: decide what every symbol becomes and check consistency.
pub struct CollateSymbolsPass;

impl Pass for CollateSymbolsPass {
    fn name(&self) -> &'static str {
        "collate-symbols"
    }

    fn run(&self, ctx: &Context) -> Result<()> {
        let registry = load_registry(ctx)?;
        let types = classify_all(
            &registry,
            &ctx.config.symbol_rules,
            ctx.config.layout.trunk_only,
        )?;
        store::save(ctx.artifacts.path("symbol-types"), &types)
    }
}

/// Pass 3: group revisions into changesets.
///
/// Revisions on excluded branches are dropped first, except revisions of a
/// file's default branch, which are grafted onto trunk so a plain checkout
/// still matches CVS.
pub struct BuildChangesetsPass;

impl BuildChangesetsPass {
    fn graft_and_exclude(items: &mut [CvsItem], types: &[SymbolType]) -> usize {
        let mut dropped = 0;
        for item in items.iter_mut() {
            let CvsItem::Revision(rev) = item else { continue };
            let Lod::Branch(branch) = rev.lod else { continue };
            if types[branch.index()] != SymbolType::Excluded {
                continue;
            }
            if rev.default_branch_revision {
                rev.lod = Lod::Trunk;
                rev.first_on_branch = false;
                rev.default_branch_revision = false;
            } else {
                dropped += 1;
            }
        }
        dropped
    }

    fn is_converted(rev: &CvsRevision, types: &[SymbolType]) -> bool {
        match rev.lod {
            Lod::Trunk => true,
            Lod::Branch(branch) => types[branch.index()] != SymbolType::Excluded,
        }
    }
}

impl Pass for BuildChangesetsPass {
    fn name(&self) -> &'static str {
        "build-changesets"
    }

    fn run(&self, ctx: &Context) -> Result<()> {
        let mut items = load_items(ctx, "cvs-items")?;
        let types: Vec<SymbolType> = store::load(ctx.artifacts.path("symbol-types"))?;

        let dropped = Self::graft_and_exclude(&mut items, &types);
        if dropped > 0 {
            log::info!("{} revision(s) on excluded branches will not be converted", dropped);
        }
        write_items(ctx, "cvs-items-final", &items)?;

        let revisions = items
            .iter()
            .filter_map(|i| i.as_revision())
            .filter(|r| Self::is_converted(r, &types))
            .sorted_by_key(|r| (r.timestamp, r.id));
        let mut builder = ChangesetBuilder::new();
        for revision in revisions {
            builder.add_revision(revision);
        }
        let mut changesets = builder.finish();

        let next_id = changesets.iter().map(|c| c.id.0 + 1).max().unwrap_or(0);
        changesets.extend(build_symbol_changesets(&items, &types, next_id));
        log::info!("built {} changeset(s)", changesets.len());
        store::save(ctx.artifacts.path("changesets"), &changesets)
    }
}

/// Pass 4: break cycles and put the changesets in revision order.
pub struct SchedulePass;

impl Pass for SchedulePass {
    fn name(&self) -> &'static str {
        "schedule"
    }

    fn run(&self, ctx: &Context) -> Result<()> {
        let items = load_items(ctx, "cvs-items-final")?;
        let changesets: Vec<Changeset> = store::load(ctx.artifacts.path("changesets"))?;
        let ordered = Scheduler::new(changesets, &items).run()?;
        store::save(ctx.artifacts.path("changesets-sorted"), &ordered)
    }
}

/// Pass 5: number the commits and log symbol openings and closings.
pub struct CreateCommitsPass;

impl Pass for CreateCommitsPass {
    fn name(&self) -> &'static str {
        "create-commits"
    }

    fn run(&self, ctx: &Context) -> Result<()> {
        let items = load_items(ctx, "cvs-items-final")?;
        let ordered: Vec<Changeset> = store::load(ctx.artifacts.path("changesets-sorted"))?;
        let metadata: Vec<Metadata> = store::load(ctx.artifacts.path("metadata"))?;
        let registry = load_registry(ctx)?;
        let types: Vec<SymbolType> = store::load(ctx.artifacts.path("symbol-types"))?;

        let layout = layout_commits(&ordered, &items, &metadata, &registry, &types)?;

        let mut writer = RecordWriter::create(ctx.artifacts.path("svn-commits"))?;
        for commit in &layout.commits {
            writer.append(commit)?;
        }
        writer.seal()?;
        store::save(ctx.artifacts.path("revision-map"), &layout.revision_map)?;
        store::save(ctx.artifacts.path("symbolings"), &layout.symbolings)
    }
}

/// Pass 6: drive the mirror and its delegates over the commit stream.
pub struct OutputPass;

impl Pass for OutputPass {
    fn name(&self) -> &'static str {
        "output"
    }

    fn run(&self, ctx: &Context) -> Result<()> {
        let files: Vec<CvsFile> = store::load(ctx.artifacts.path("cvs-files"))?;
        let items = load_items(ctx, "cvs-items-final")?;
        let registry = load_registry(ctx)?;
        let types: Vec<SymbolType> = store::load(ctx.artifacts.path("symbol-types"))?;
        let symbolings: SymbolingsIndex = store::load(ctx.artifacts.path("symbolings"))?;
        let commits: RecordReader<SvnCommit> =
            RecordReader::open(ctx.artifacts.path("svn-commits"))?;

        let layout = &ctx.config.layout;
        let mut mirror = Mirror::new(&[
            layout.trunk.as_str(),
            layout.branches.as_str(),
            layout.tags.as_str(),
        ]);

        if let Some(path) = &ctx.config.dumpfile {
            let out = std::fs::File::create(path)
                .with_context(|| format!("could not create dumpfile {}", path.display()))?;
            let writer = DumpfileWriter::new(BufWriter::new(out), Box::new(CoContentReader))?;
            mirror.add_delegate(Box::new(writer));
            log::info!("writing dumpfile to {}", path.display());
        }
        let loader = match &ctx.config.svnrepos {
            Some(path) => {
                let (loader, stdin) =
                    SvnRepositoryLoader::create(path, ctx.config.bdb_txn_nosync)?;
                let writer = DumpfileWriter::new(stdin, Box::new(CoContentReader))?;
                mirror.add_delegate(Box::new(writer));
                log::info!("loading into new repository at {}", path.display());
                Some(loader)
            }
            None => None,
        };
        let bar = progress_bar(ctx, commits.len());
        {
            let mut emitter = Emitter {
                mirror: &mut mirror,
                layout,
                files: &files,
                items: &items,
                registry: &registry,
                types: &types,
                symbolings: &symbolings,
                prune: ctx.config.prune,
                fill_history: FillHistory::new(),
            };
            emitter.run(commits.iter().map(|commit| {
                bar.inc(1);
                commit
            }))?;
        }
        bar.finish_and_clear();
        ctx.progress.remove(&bar);

        log::info!("emitted {} revision(s)", mirror.youngest());
        // Close the delegates (and with them the loader's stdin) before
        // waiting on the child.
        drop(mirror);
        if let Some(loader) = loader {
            loader.finish()?;
        }
        Ok(())
    }
}
