use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::Level;

use crate::context::Config;
use crate::context::Context;
use crate::passes::run_passes;
use crate::passes::BuildChangesetsPass;
use crate::passes::CollateSymbolsPass;
use crate::passes::CollectPass;
use crate::passes::CreateCommitsPass;
use crate::passes::OutputPass;
use crate::passes::SchedulePass;
use crate::project::Layout;
use crate::project::SymbolTransform;
use crate::symbols::StrategyRule;

mod aggregate;
mod changeset;
mod collect;
mod commit;
mod context;
mod dump;
mod emit;
mod fill;
mod metadata;
mod mirror;
mod model;
mod passes;
mod project;
mod rcs;
mod rlog;
mod schedule;
mod store;
mod symbolings;
mod symbols;

/// Convert a CVS repository into a Subversion repository
///
/// The conversion reads the per-file RCS histories under the given path,
/// groups them into atomic commits, decides which symbolic names become
/// branches or tags, and produces either an SVN dumpfile or a freshly
/// loaded repository.
///
/// CVS has no atomic commits, so commit boundaries are reconstructed from
/// author, log message and time proximity; dependencies between file
/// revisions always take precedence over timestamps.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the CVS repository or a project directory inside it
    ///
    /// A `CVSROOT` directory must exist at the path or one of its
    /// ancestors.
    cvs_repos_path: PathBuf,

    /// Write the conversion as an SVN dumpfile (format 2) to this path
    #[arg(long, value_name = "PATH")]
    dumpfile: Option<PathBuf>,

    /// Create a Subversion repository at this path and load into it
    ///
    /// Requires a working `svnadmin` on the PATH.
    #[arg(short = 's', long = "svnrepos", value_name = "PATH")]
    svnrepos: Option<PathBuf>,

    /// SVN path for the main development line
    #[arg(long, default_value = "trunk", value_name = "PATH")]
    trunk: String,

    /// SVN path under which branches are created
    #[arg(long, default_value = "branches", value_name = "PATH")]
    branches: String,

    /// SVN path under which tags are created
    #[arg(long, default_value = "tags", value_name = "PATH")]
    tags: String,

    /// Convert only trunk commits; skip all branches and tags
    #[arg(long)]
    trunk_only: bool,

    /// Exclude symbols matching the regex (repeatable)
    ///
    /// Exclusion rules are tried before --force-branch and --force-tag
    /// rules; within each kind, rules apply in the order given.
    #[arg(long, value_name = "REGEX")]
    exclude: Vec<String>,

    /// Convert symbols matching the regex as branches (repeatable)
    #[arg(long, value_name = "REGEX")]
    force_branch: Vec<String>,

    /// Convert symbols matching the regex as tags (repeatable)
    #[arg(long, value_name = "REGEX")]
    force_tag: Vec<String>,

    /// Rename symbols: a PATTERN:SUBST regex substitution (repeatable)
    ///
    /// The pattern must match the whole symbol name. The first matching
    /// transform wins.
    #[arg(long, value_name = "P:S")]
    symbol_transform: Vec<String>,

    /// Character encoding of author names and log messages (repeatable,
    /// tried in order)
    #[arg(long, value_name = "ENC")]
    encoding: Vec<String>,

    /// Encoding to fall back to, with a warning, when none of the
    /// --encoding values decode a text
    #[arg(long, value_name = "ENC")]
    fallback_encoding: Option<String>,

    /// Do not prune directories that a delete leaves empty
    #[arg(long)]
    no_prune: bool,

    /// Directory for intermediate files
    ///
    /// Defaults to a temporary directory that is removed afterwards; a
    /// directory given here is kept.
    #[arg(long, value_name = "PATH")]
    tmpdir: Option<PathBuf>,

    /// Pass --bdb-txn-nosync to svnadmin create (Berkeley DB repositories)
    #[arg(long)]
    bdb_txn_nosync: bool,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn build_config(cli: &Cli) -> Result<Config> {
    if cli.dumpfile.is_none() && cli.svnrepos.is_none() {
        anyhow::bail!("no output requested; pass --dumpfile PATH or -s SVN-REPOS-PATH");
    }

    let layout = Layout::new(&cli.trunk, &cli.branches, &cli.tags, cli.trunk_only)?;

    let mut symbol_rules = Vec::new();
    for pattern in &cli.exclude {
        symbol_rules.push(StrategyRule::Exclude(StrategyRule::compile("--exclude", pattern)?));
    }
    for pattern in &cli.force_branch {
        symbol_rules
            .push(StrategyRule::ForceBranch(StrategyRule::compile("--force-branch", pattern)?));
    }
    for pattern in &cli.force_tag {
        symbol_rules.push(StrategyRule::ForceTag(StrategyRule::compile("--force-tag", pattern)?));
    }

    let symbol_transforms = cli
        .symbol_transform
        .iter()
        .map(|rule| SymbolTransform::parse(rule))
        .collect::<Result<Vec<_>>>()?;

    // Catch bad encoding names before any work happens.
    crate::metadata::Decoder::new(&cli.encoding, cli.fallback_encoding.as_deref())?;

    Ok(Config {
        cvs_path: cli.cvs_repos_path.clone(),
        layout,
        prune: !cli.no_prune,
        encodings: cli.encoding.clone(),
        fallback_encoding: cli.fallback_encoding.clone(),
        symbol_rules,
        symbol_transforms,
        dumpfile: cli.dumpfile.clone(),
        svnrepos: cli.svnrepos.clone(),
        bdb_txn_nosync: cli.bdb_txn_nosync,
    })
}

fn run(cli: Cli, progress: MultiProgress) -> Result<()> {
    let config = build_config(&cli)?;
    let ctx = Context::new(config, cli.tmpdir.clone(), progress)?;
    run_passes(
        &ctx,
        &[
            &CollectPass,
            &CollateSymbolsPass,
            &BuildChangesetsPass,
            &SchedulePass,
            &CreateCommitsPass,
            &OutputPass,
        ],
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logger = env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .format(|buf, record| {
            let prefix = match record.level() {
                Level::Error => "ERROR: ",
                Level::Warn => "WARNING: ",
                _ => "",
            };
            writeln!(buf, "{}{}", prefix, record.args())
        })
        .build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init().expect("logger installed once");

    match run(cli, progress) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{:#}", error);
            ExitCode::FAILURE
        }
    }
}
