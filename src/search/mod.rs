//! Call-chain discovery for one vulnerability record.

mod builder;
mod materialize;
mod order;
mod record;
mod tree;

pub use builder::{
    BuildOutcome, BuildReport, CallTreeBuilder, ChainPath, EntryConfirmer, NEUTRAL_SCORE,
};
pub use materialize::{ChainMaterializer, CHAIN_SEPARATOR, FALSE_POSITIVE_NOTE};
pub use order::Ordering;
pub use record::{base_extra, load_records, VulnRecord};
pub use tree::{CallNode, CallTree, NodeId};

use crate::callers::CallerResolver;
use crate::config::Config;
use crate::index::SymbolSource;
use crate::oracle::{ChatTurn, Oracle};
use std::path::PathBuf;
use tracing::info;

/// Collaborators of a search session.
pub struct SearchContext<'a> {
    pub config: &'a Config,
    pub oracle: &'a dyn Oracle,
    pub callers: &'a dyn CallerResolver,
    pub symbols: &'a dyn SymbolSource,
    pub confirmer: Option<&'a dyn EntryConfirmer>,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub id: String,
    pub outcome: BuildOutcome,
    /// Extra files produced for downstream agents: the numbered chains of an
    /// exhausted build, or the single VulPath extra.
    pub extras: Vec<PathBuf>,
}

/// Build, materialize and record the search for `record`.
///
/// A record whose VulPath extra already exists is not searched again.
pub async fn run_session(ctx: &SearchContext<'_>, record: &VulnRecord) -> anyhow::Result<SessionOutcome> {
    let layout = ctx.config.layout();
    let vulpath = layout.vulpath_extra(&record.id);
    if vulpath.exists() {
        info!(session = %record.id, "vulnerable path already recorded, skipping search");
        return Ok(SessionOutcome {
            id: record.id.clone(),
            outcome: BuildOutcome::VulPath {
                node: CallTree::new(&record.function, None).root(),
            },
            extras: vec![vulpath],
        });
    }

    let base = base_extra(record, &ctx.config.project.source_path, &layout)?;
    let mut builder = CallTreeBuilder::new(&ctx.config.search, ctx.oracle, ctx.callers, ctx.symbols)
        .with_description(&base)
        .with_sink_code(&record.sink_code())
        .with_project(&ctx.config.project.name)
        .with_session(&record.id);
    if let Some(confirmer) = ctx.confirmer {
        builder = builder.with_confirmer(confirmer);
    }

    info!(session = %record.id, function = %record.function, "starting caller search");
    let report = builder.build(&record.function, None).await;

    let materializer = ChainMaterializer::new(&layout, &record.id, &base);
    let extras = match &report.outcome {
        BuildOutcome::VulPath { node } => vec![materializer.write_vulpath(&report.tree, *node)?],
        BuildOutcome::Exhausted { chains } => materializer.write_chains(&report.tree, chains)?,
        BuildOutcome::Pruned => {
            materializer.write_prune_marker()?;
            Vec::new()
        }
        BuildOutcome::LengthExceeded { function } => {
            materializer.write_length_marker(function)?;
            Vec::new()
        }
    };

    let mut transcript = vec![ChatTurn::system(format!(
        "Oracle exchanges of the caller search for {} (record {}).",
        record.function, record.id
    ))];
    transcript.extend(report.transcript);
    crate::testcase::save_history(&layout.history_file("PathAgent", &record.id), &transcript)?;

    info!(
        session = %record.id,
        outcome = report.outcome.label(),
        extras = extras.len(),
        "caller search finished"
    );
    Ok(SessionOutcome {
        id: record.id.clone(),
        outcome: report.outcome,
        extras,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callers::StaticCallGraph;
    use crate::index::InMemorySymbols;
    use crate::oracle::{Judgment, OracleRequest, ScriptedOracle};
    use tempfile::tempdir;

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.project.name = "demo".into();
        config.project.work_dir = root.to_path_buf();
        config.project.source_path = root.join("src");
        config.search.seed = Some(1);
        config
    }

    fn record() -> VulnRecord {
        VulnRecord {
            id: "5".into(),
            function: "sink".into(),
            description: "overflow".into(),
            vul_code: "n * size".into(),
            ..VulnRecord::default()
        }
    }

    #[tokio::test]
    async fn test_pruned_record_leaves_marker_only() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } => Some(Judgment::Verdict(true)),
            _ => None,
        });
        let callers = StaticCallGraph::new().with_edge("main", "sink");
        let symbols = InMemorySymbols::new();
        let ctx = SearchContext {
            config: &config,
            oracle: &oracle,
            callers: &callers,
            symbols: &symbols,
            confirmer: None,
        };

        let outcome = run_session(&ctx, &record()).await.unwrap();
        let layout = config.layout();
        assert_eq!(outcome.outcome, BuildOutcome::Pruned);
        assert!(layout.prune_marker("5").exists());
        assert!(!layout.funcname_file("5").exists());
        assert!(!layout.vulpath_extra("5").exists());
        assert!(layout.history_file("PathAgent", "5").exists());
    }

    #[tokio::test]
    async fn test_early_stop_writes_single_vulpath() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } => Some(Judgment::Verdict(false)),
            OracleRequest::EarlyStop { function, .. } => Some(Judgment::Verdict(function == "main")),
            OracleRequest::Rank { .. } => Some(Judgment::Score(50.0)),
            _ => None,
        });
        let callers = StaticCallGraph::new()
            .with_edge("helper", "sink")
            .with_edge("main", "helper");
        let symbols = InMemorySymbols::new();
        let ctx = SearchContext {
            config: &config,
            oracle: &oracle,
            callers: &callers,
            symbols: &symbols,
            confirmer: None,
        };

        let outcome = run_session(&ctx, &record()).await.unwrap();
        let layout = config.layout();
        assert!(matches!(outcome.outcome, BuildOutcome::VulPath { .. }));
        assert_eq!(outcome.extras, vec![layout.vulpath_extra("5")]);
        let extra = std::fs::read_to_string(layout.vulpath_extra("5")).unwrap();
        assert!(extra.starts_with("Vulnerability Description:\noverflow"));
        assert!(extra.contains("sink -> helper -> main"));
        assert!(!layout.extra_dir("5").join("1").exists());
    }

    #[tokio::test]
    async fn test_exhausted_search_materializes_every_leaf() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } | OracleRequest::EarlyStop { .. } => {
                Some(Judgment::Verdict(false))
            }
            OracleRequest::Rank { .. } => Some(Judgment::Score(50.0)),
            _ => None,
        });
        let callers = StaticCallGraph::new()
            .with_edge("a", "sink")
            .with_edge("b", "sink");
        let symbols = InMemorySymbols::new();
        let ctx = SearchContext {
            config: &config,
            oracle: &oracle,
            callers: &callers,
            symbols: &symbols,
            confirmer: None,
        };

        let outcome = run_session(&ctx, &record()).await.unwrap();
        assert_eq!(outcome.extras.len(), 2);
        assert!(outcome.extras.iter().all(|p| p.exists()));
    }
}
