use anyhow::{Context, Result, bail, ensure};
use byte_unit::Byte;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::client;
use crate::commit;
use crate::config::Configuration;
use crate::hlink::HLinkDb;
use crate::index::{Index, MetaStoreReader};
use crate::paths::{self, Graft, Mapping};
use crate::save::{self, SaveOptions};
use crate::store::{self, ObjectStore, fs::FsStore};

/// Archive the indexed sources as trees and (optionally) a commit.
#[derive(Debug, Parser)]
pub struct Args {
    /// hostname:/path/to/repo of remote repository
    #[clap(short = 'r', long)]
    remote: Option<String>,

    /// Output a tree id
    #[clap(short = 't', long)]
    tree: bool,

    /// Output a commit id
    #[clap(short = 'c', long)]
    commit: bool,

    /// Name of backup set to update (if any)
    #[clap(short = 'n', long)]
    name: Option<String>,

    /// Date for the commit (seconds since the epoch)
    #[clap(short = 'd', long)]
    date: Option<i64>,

    /// Only back up files smaller than n bytes
    #[clap(long, value_name = "N")]
    smaller: Option<Byte>,

    /// Maximum bytes/sec to transmit to server
    #[clap(long, value_name = "N")]
    bwlimit: Option<Byte>,

    /// The name of the index file (normally REPO/bupindex)
    #[clap(short = 'f', long)]
    indexfile: Option<Utf8PathBuf>,

    /// Strip the source path prefix from every archived filename
    #[clap(long, conflicts_with_all = ["strip_path", "grafts"])]
    strip: bool,

    /// Path prefix to be stripped when saving
    #[clap(long, conflicts_with = "grafts")]
    strip_path: Option<Utf8PathBuf>,

    /// A graft point old_path=new_path (can be used more than once)
    #[clap(long = "graft", value_name = "OLD=NEW")]
    grafts: Vec<String>,

    /// Set compression level (0-9, 9 is highest)
    #[clap(long, value_name = "LEVEL")]
    compress: Option<i32>,

    /// What to save
    #[clap(required = true)]
    sources: Vec<Utf8PathBuf>,
}

pub fn run(config: &Configuration, repo: &Utf8Path, verbose: u8, args: Args) -> Result<()> {
    ensure!(
        args.tree || args.commit || args.name.is_some(),
        "use one or more of -t, -c, -n"
    );
    if let Some(name) = &args.name {
        ensure!(
            store::valid_ref_name(name),
            "'{name}' is not a valid branch name"
        );
    }

    let reverse_spec = std::env::var("DUFFEL_SERVER_REVERSE").ok();
    if reverse_spec.is_some() && args.remote.is_some() {
        bail!("don't use -r in reverse mode; it's automatic");
    }

    let sources = paths::normalize_sources(&args.sources)?;
    let mapping = if args.strip {
        Mapping::Strip(sources.clone())
    } else if let Some(p) = &args.strip_path {
        Mapping::StripPath(paths::normalize_sources(std::slice::from_ref(p))?.remove(0))
    } else if !args.grafts.is_empty() {
        let grafts = args
            .grafts
            .iter()
            .map(|g| Graft::parse(g))
            .collect::<Result<Vec<_>>>()?;
        Mapping::Graft(grafts)
    } else {
        Mapping::Identity
    };

    let compress = args.compress.or(config.compress).unwrap_or(1);
    let mut store: Box<dyn ObjectStore> = match args.remote.as_deref().or(reverse_spec.as_deref())
    {
        Some(spec) => Box::new(client::connect(spec, compress)?),
        None => Box::new(FsStore::open(repo, compress)?),
    };
    if let Some(limit) = args.bwlimit {
        store = Box::new(client::Throttled::new(store, limit.as_u64()));
    }

    let indexfile = args.indexfile.unwrap_or_else(|| repo.join("bupindex"));
    let mut index = Index::open(&indexfile)?;
    let metastore = MetaStoreReader::open(&Utf8PathBuf::from(format!("{indexfile}.meta")))?;
    let hlinks = HLinkDb::open(&Utf8PathBuf::from(format!("{indexfile}.hlink")))?;

    let (parent, refname) = match &args.name {
        Some(name) => (store.read_ref(name)?, Some(name.clone())),
        None => (None, None),
    };

    let opts = SaveOptions {
        smaller: args.smaller.map(|b| b.as_u64()).unwrap_or(0),
        mapping,
        verbose,
    };
    let root = save::save_tree(
        store.as_mut(),
        &mut index,
        &metastore,
        &hlinks,
        &sources,
        &opts,
    )?;

    if args.tree {
        println!("{root}");
    }

    let commit_oid = if args.commit || args.name.is_some() {
        let date = args
            .date
            .unwrap_or_else(|| jiff::Timestamp::now().as_second());
        let argv: Vec<String> = std::env::args().collect();
        let oid = commit::commit_tree(store.as_mut(), &root, parent.as_ref(), date, &argv)?;
        if args.commit {
            println!("{oid}");
        }
        Some(oid)
    } else {
        None
    };

    // The index, metadata store, and hardlink DB are done; the ref moves
    // only after everything it points at has been written.
    drop((index, metastore, hlinks));
    if let Some(name) = refname {
        let commit_oid = commit_oid.expect("-n implies a commit");
        store
            .update_ref(&name, &commit_oid, parent.as_ref())
            .with_context(|| format!("Couldn't advance {name}"))?;
    }
    Ok(())
}
