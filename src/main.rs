use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use estuary::manifest::NodeId;
use estuary::repo::Repo;
use estuary::update::{
    abort_op, continue_op, graft, merge, resolve, update, GraftOptions, MergeOptions,
    ResolveChoice, UpdateOptions,
};

/// Working-copy merge and checkout engine
///
/// Estuary reconciles a working copy with a target revision against
/// their common ancestor: it plans a per-file action set, checks it
/// against untracked files and path collisions, applies it with
/// parallel workers, and records the result in the dirstate.
///
/// Conflicts never block halfway: they are recorded in a durable
/// merge state, the working copy gets conflict markers, and `resolve`,
/// `continue`, and `abort` pick up from there.
#[derive(Parser)]
#[command(name = "estuary")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'estuary <command> --help' for details on a specific command.")]
struct Cli {
    /// Repository root (defaults to the current directory).
    #[arg(long, global = true, env = "ESTUARY_REPO")]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Update the working copy to a revision
    Update {
        /// Target revision id.
        rev: String,
        /// Discard conflicting local changes instead of aborting.
        #[arg(long)]
        force: bool,
        /// Dirty-working-copy rule: none, linear, or noconflict.
        #[arg(long)]
        check: Option<String>,
    },
    /// Merge a revision into the working copy
    Merge {
        /// Revision to merge.
        rev: String,
        /// Merge despite a dirty working copy.
        #[arg(long)]
        force: bool,
        /// Use this revision as the merge ancestor.
        #[arg(long)]
        ancestor: Option<String>,
        /// Allow merging with a descendant of the working copy.
        #[arg(long)]
        mergeancestor: bool,
    },
    /// Copy a commit's changes onto the working copy
    Graft {
        /// Commit to graft.
        rev: String,
        /// Merge base (defaults to the commit's first parent).
        #[arg(long)]
        base: Option<String>,
        /// Keep the grafted commit's parent as a second parent.
        #[arg(long)]
        keepparent: bool,
    },
    /// Settle recorded merge conflicts
    Resolve {
        /// Conflicted paths (all of them when omitted).
        paths: Vec<String>,
        /// Mark the files resolved as they stand on disk.
        #[arg(long, conflicts_with_all = ["take_local", "take_other", "rerun"])]
        mark: bool,
        /// Keep the local side of change/delete conflicts.
        #[arg(long = "take-local")]
        take_local: bool,
        /// Take the other side of change/delete conflicts.
        #[arg(long = "take-other")]
        take_other: bool,
        /// Re-run the automatic merge machinery.
        #[arg(long)]
        rerun: bool,
    },
    /// Resume an interrupted operation
    Continue,
    /// Abort an interrupted or conflicted operation
    Abort,
}

fn parse_rev(s: &str) -> Result<NodeId> {
    NodeId::new(s).with_context(|| format!("'{s}' is not a revision id"))
}

fn main() -> Result<()> {
    let _telemetry = estuary::telemetry::init();
    let cli = Cli::parse();

    let root = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let mut repo = Repo::open(&root)?;

    match cli.command {
        Commands::Update { rev, force, check } => {
            let check = match check.as_deref() {
                None => None,
                Some("none") => Some(estuary::config::UpdateCheck::None),
                Some("linear") => Some(estuary::config::UpdateCheck::Linear),
                Some("noconflict") => Some(estuary::config::UpdateCheck::NoConflict),
                Some(other) => bail!("unknown --check mode '{other}' (want none, linear, or noconflict)"),
            };
            let stats = update(&mut repo, &parse_rev(&rev)?, UpdateOptions { force, check })?;
            println!("{stats}");
            if stats.unresolved > 0 {
                println!("use 'estuary resolve' to settle conflicted files");
            }
        }
        Commands::Merge { rev, force, ancestor, mergeancestor } => {
            let opts = MergeOptions {
                force,
                ancestor: ancestor.as_deref().map(parse_rev).transpose()?,
                mergeancestor,
            };
            let stats = merge(&mut repo, &parse_rev(&rev)?, opts)?;
            println!("{stats}");
            if stats.unresolved > 0 {
                println!("use 'estuary resolve' to settle conflicted files, then commit");
            } else {
                println!("(branch merge, don't forget to commit)");
            }
        }
        Commands::Graft { rev, base, keepparent } => {
            let opts = GraftOptions {
                base: base.as_deref().map(parse_rev).transpose()?,
                keepparent,
            };
            let stats = graft(&mut repo, &parse_rev(&rev)?, opts)?;
            println!("{stats}");
        }
        Commands::Resolve { paths, mark: _, take_local, take_other, rerun } => {
            // --mark is the default; the flag exists so intent can be
            // spelled out and so clap can reject contradictory flags.
            let choice = if take_local {
                ResolveChoice::TakeLocal
            } else if take_other {
                ResolveChoice::TakeOther
            } else if rerun {
                ResolveChoice::Rerun
            } else {
                ResolveChoice::Mark
            };
            let unresolved = resolve(&mut repo, &paths, choice)?;
            if unresolved == 0 {
                println!("all conflicts resolved");
            } else {
                println!("{unresolved} file(s) still unresolved");
            }
        }
        Commands::Continue => {
            let stats = continue_op(&mut repo)?;
            println!("{stats}");
        }
        Commands::Abort => {
            let stats = abort_op(&mut repo)?;
            println!("aborted; working copy restored ({stats})");
        }
    }

    Ok(())
}
