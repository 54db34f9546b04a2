//! vulchain - finds call chains from program entry points to a flagged sink
//! and asks agents to reproduce them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vulchain::batch::BatchRunner;
use vulchain::callers::CallerResolver;
use vulchain::config::Config;
use vulchain::index::SymbolIndex;
use vulchain::oracle::LlmOracle;
use vulchain::poc::run_poc;
use vulchain::search::{load_records, VulnRecord};
use vulchain::store::{CounterStore, FileStore};
use vulchain::testcase::run_testcases;
use vulchain::{callers, logging};

#[derive(Parser, Debug)]
#[command(
    name = "vulchain",
    about = "LLM-guided call-chain search from entry points to a vulnerable sink",
    version
)]
struct Args {
    /// Config file (defaults to ./vulchain.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Search call chains for a single finding
    Search {
        /// JSON export of findings
        #[arg(long, requires = "id")]
        records: Option<PathBuf>,
        /// Finding id inside --records
        #[arg(long)]
        id: Option<String>,
        /// Sink function to search from, without a findings file
        #[arg(long, conflicts_with = "records")]
        function: Option<String>,
    },
    /// Search every finding of a findings file, resuming where the last run stopped
    Batch {
        #[arg(long)]
        records: PathBuf,
    },
    /// Generate an input that reaches the sink for each chain of a finding
    Testcase {
        #[arg(long)]
        id: String,
        /// Entry function used when a chain does not name one
        #[arg(long)]
        function: String,
    },
    /// Turn a reaching input into a sanitizer-confirmed proof of concept
    Poc {
        /// Project source directory
        #[arg(short = 'p', long)]
        project: PathBuf,
        /// Target binary
        #[arg(short = 'b', long)]
        binary: PathBuf,
        /// Entry function
        #[arg(short = 'f', long)]
        function: String,
        /// Testcase context file
        #[arg(short = 'e', long)]
        extra: PathBuf,
        #[arg(long, default_value = "poc")]
        id: String,
    },
    /// Build the symbol index and print the definition of a function
    Index {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let mut config = Config::load(args.config.as_deref());

    match args.command {
        Cmd::Search {
            records,
            id,
            function,
        } => {
            let record = match (records, function) {
                (Some(path), _) => {
                    let id = id.unwrap_or_default();
                    load_records(&path)?
                        .into_iter()
                        .find(|r| r.id == id)
                        .with_context(|| format!("No record with id {} in {}", id, path.display()))?
                }
                (None, Some(function)) => VulnRecord {
                    id: id.unwrap_or_else(|| function.clone()),
                    function,
                    ..VulnRecord::default()
                },
                (None, None) => bail!("search needs --records/--id or --function"),
            };
            let runtime = Runtime::open(&config)?;
            let callers = callers::from_config(&config)?;
            let runner = runtime.batch_runner(&config, args.config.as_deref(), callers.as_ref());
            let row = runner.run_one(&record).await?;
            println!("{}", row.to_line());
        }
        Cmd::Batch { records } => {
            let records = load_records(&records)?;
            let runtime = Runtime::open(&config)?;
            let callers = callers::from_config(&config)?;
            let runner = runtime.batch_runner(&config, args.config.as_deref(), callers.as_ref());
            let summary = runner.run(&records).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Cmd::Testcase { id, function } => {
            let runtime = Runtime::open(&config)?;
            let winner = run_testcases(
                &config,
                &runtime.oracle,
                runtime.index.clone(),
                runtime.store.clone(),
                &id,
                &function,
            )
            .await?;
            match winner {
                Some(extra) => info!(extra = %extra.display(), "testcase found"),
                None => bail!("no testcase reached the target for {}", id),
            }
        }
        Cmd::Poc {
            project,
            binary,
            function,
            extra,
            id,
        } => {
            config.project.source_path = project;
            config.project.binary_path = binary;
            let runtime = Runtime::open(&config)?;
            let outcome = run_poc(
                &config,
                &runtime.oracle,
                runtime.index.clone(),
                runtime.store.clone(),
                &id,
                &function,
                &extra,
            )
            .await?;
            if !outcome.succeeded() {
                bail!("proof of concept not confirmed: {:?}", outcome);
            }
        }
        Cmd::Index { name } => {
            let index = SymbolIndex::load_or_build(
                &config.project.source_path,
                &config.index_cache_path(),
            )?;
            eprintln!("{} definitions indexed", index.len());
            println!("{}", index.lookup(&name));
        }
    }

    Ok(())
}

/// Long-lived collaborators shared by the subcommands.
struct Runtime {
    store: Arc<dyn CounterStore>,
    oracle: LlmOracle,
    index: Arc<SymbolIndex>,
}

impl Runtime {
    fn open(config: &Config) -> Result<Self> {
        let store: Arc<dyn CounterStore> = Arc::new(FileStore::open(
            &config.store_path(),
            Duration::from_secs(config.store.ttl_secs),
        )?);
        let oracle = LlmOracle::from_config(config)?.with_store(store.clone());
        let index = Arc::new(SymbolIndex::load_or_build(
            &config.project.source_path,
            &config.index_cache_path(),
        )?);
        Ok(Self {
            store,
            oracle,
            index,
        })
    }

    fn batch_runner<'a>(
        &'a self,
        config: &'a Config,
        config_path: Option<&Path>,
        callers: &'a dyn CallerResolver,
    ) -> BatchRunner<'a> {
        BatchRunner::new(
            config,
            config_path,
            &self.oracle,
            callers,
            self.index.as_ref(),
            self.store.clone(),
        )
    }
}
