//! Breadth-first "who calls me" search from a vulnerable function.
//!
//! Each expansion asks the oracle three things about the candidate chains:
//! whether the outermost body can be reduced, whether a caller is already an
//! entry point, and whether a chain can still reach the sink. Survivors are
//! ranked and queued one depth further out until the depth bound.

use super::order::Ordering;
use super::tree::{CallTree, NodeId};
use crate::callers::CallerResolver;
use crate::config::SearchConfig;
use crate::error::BuildAbort;
use crate::index::SymbolSource;
use crate::oracle::{ChainContext, ChatTurn, Judgment, Oracle, OracleRequest};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// Rank used when the oracle cannot score a branch.
pub const NEUTRAL_SCORE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// An entry point was found; the path from the root to `node` is the chain.
    VulPath { node: NodeId },
    /// The queue ran dry. `chains` are the surviving leaves, empty when the
    /// root never gained a caller.
    Exhausted { chains: Vec<NodeId> },
    /// The root itself was judged unreachable.
    Pruned,
    /// A body did not fit the oracle context.
    LengthExceeded { function: String },
}

impl BuildOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::VulPath { .. } => "vulpath",
            Self::Exhausted { .. } => "exhausted",
            Self::Pruned => "pruned",
            Self::LengthExceeded { .. } => "length-exceeded",
        }
    }
}

#[derive(Debug)]
pub struct BuildReport {
    pub tree: CallTree,
    pub outcome: BuildOutcome,
    /// Oracle exchanges, in order, for the session history file
    pub transcript: Vec<ChatTurn>,
}

/// A root-first chain handed to an [`EntryConfirmer`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChainPath {
    pub names: Vec<String>,
    pub bodies: Vec<String>,
}

/// Second opinion on an oracle "entry point" judgment, e.g. by actually
/// generating an input that reaches the sink.
pub trait EntryConfirmer: Send + Sync {
    fn confirm<'a>(&'a self, chain: &'a ChainPath)
        -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

pub struct CallTreeBuilder<'a> {
    settings: SearchConfig,
    oracle: &'a dyn Oracle,
    callers: &'a dyn CallerResolver,
    symbols: &'a dyn SymbolSource,
    confirmer: Option<&'a dyn EntryConfirmer>,
    description: String,
    sink_code: String,
    project: String,
    session: String,
}

impl<'a> CallTreeBuilder<'a> {
    pub fn new(
        settings: &SearchConfig,
        oracle: &'a dyn Oracle,
        callers: &'a dyn CallerResolver,
        symbols: &'a dyn SymbolSource,
    ) -> Self {
        Self {
            settings: settings.clone(),
            oracle,
            callers,
            symbols,
            confirmer: None,
            description: String::new(),
            sink_code: String::new(),
            project: String::new(),
            session: String::new(),
        }
    }

    /// Vulnerability text every chain judgment is made against.
    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_sink_code(mut self, sink_code: &str) -> Self {
        self.sink_code = sink_code.to_string();
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = project.to_string();
        self
    }

    /// Identifier attached to every log line of this build.
    pub fn with_session(mut self, session: &str) -> Self {
        self.session = session.to_string();
        self
    }

    pub fn with_confirmer(mut self, confirmer: &'a dyn EntryConfirmer) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub async fn build(&self, root_name: &str, root_body: Option<String>) -> BuildReport {
        let root_body = root_body.unwrap_or_else(|| self.symbols.body(root_name));
        let mut tree = CallTree::new(root_name, Some(root_body));
        let mut transcript = Vec::new();
        let root = tree.root();

        if self.should_prune(&tree, root, &mut transcript).await {
            info!(session = %self.session, function = root_name, "root judged a false positive");
            return BuildReport {
                tree,
                outcome: BuildOutcome::Pruned,
                transcript,
            };
        }

        let mut rng = match self.settings.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let mut queue = VecDeque::from([(root, 0usize)]);

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= self.settings.max_depth {
                continue;
            }
            info!(
                session = %self.session,
                depth,
                function = %tree.node(node).name,
                "expanding node"
            );

            match self.slice(&tree, node, &mut transcript).await {
                Ok(body) => tree.set_body(node, body),
                Err(BuildAbort::LengthExceeded { function }) => {
                    warn!(session = %self.session, %function, "body too large, build aborted");
                    return BuildReport {
                        tree,
                        outcome: BuildOutcome::LengthExceeded { function },
                        transcript,
                    };
                }
            }

            let mut survivors = Vec::new();
            for caller in self.sample_callers(&tree, node, &mut rng) {
                let body = self.symbols.body(&caller);
                let child = tree.add_child(node, &caller, Some(body));
                debug!(session = %self.session, depth = depth + 1, function = %caller, "judging caller");

                if self.is_entry_point(&tree, child, &mut transcript).await {
                    info!(
                        session = %self.session,
                        chain = %tree.path_names(child).join(" -> "),
                        "entry point reached, stopping search"
                    );
                    return BuildReport {
                        tree,
                        outcome: BuildOutcome::VulPath { node: child },
                        transcript,
                    };
                }

                if self.should_prune(&tree, child, &mut transcript).await {
                    info!(
                        session = %self.session,
                        chain = %tree.path_names(child).join(" -> "),
                        "chain pruned"
                    );
                    tree.detach(child);
                    continue;
                }
                survivors.push(child);
            }

            for child in self.order(&tree, survivors, &mut rng).await {
                queue.push_back((child, depth + 1));
            }
        }

        let root_only = tree.node(root).children().is_empty();
        let chains = if root_only { Vec::new() } else { tree.leaves() };
        info!(
            session = %self.session,
            chains = chains.len(),
            "search exhausted without an entry point"
        );
        BuildReport {
            tree,
            outcome: BuildOutcome::Exhausted { chains },
            transcript,
        }
    }

    /// Callers of `node`, minus its ancestors when deduplication is on, and
    /// sampled down to the fan-out cap. Sampling trades completeness for a
    /// bounded search on heavily used helpers.
    fn sample_callers(&self, tree: &CallTree, node: NodeId, rng: &mut fastrand::Rng) -> Vec<String> {
        let name = &tree.node(node).name;
        let mut callers = match self.callers.callers(name) {
            Ok(callers) => callers,
            Err(err) => {
                warn!(session = %self.session, function = %name, "caller lookup failed: {}", err);
                Vec::new()
            }
        };
        callers.sort();
        callers.dedup();
        if self.settings.dedup_ancestors {
            callers.retain(|c| !tree.has_ancestor_named(node, c));
        }
        if callers.len() > self.settings.fan_out {
            let total = callers.len();
            let mut sample = rng.choose_multiple(callers.into_iter(), self.settings.fan_out);
            sample.sort();
            debug!(
                session = %self.session,
                function = %name,
                total,
                kept = sample.len(),
                "sampled callers"
            );
            sample
        } else {
            callers
        }
    }

    fn chain(&self, tree: &CallTree, id: NodeId, include_self: bool) -> ChainContext {
        let names = tree.path_names(id);
        let mut bodies: Vec<String> = tree
            .path_bodies(id)
            .into_iter()
            .zip(names.iter())
            .map(|(body, name)| body.unwrap_or_else(|| name.clone()))
            .collect();
        if !include_self {
            bodies.pop();
        }
        ChainContext {
            description: self.description.clone(),
            names,
            bodies,
        }
    }

    async fn should_prune(&self, tree: &CallTree, id: NodeId, transcript: &mut Vec<ChatTurn>) -> bool {
        if !self.settings.prune_enabled {
            return false;
        }
        let chain = self.chain(tree, id, true);
        transcript.push(ChatTurn::user(format!("PRUNE: {}", chain.call_line())));
        let judgment = self.oracle.judge(&OracleRequest::Prune { chain }).await;
        let prune = match judgment {
            Judgment::Verdict(prune) => prune,
            Judgment::SizeExceeded => {
                warn!(session = %self.session, "prune request too large, keeping chain");
                false
            }
            other => {
                warn!(session = %self.session, "prune judgment unavailable ({:?}), keeping chain", other);
                false
            }
        };
        transcript.push(ChatTurn::assistant(if prune {
            "no vulnerability"
        } else {
            "may vulnerability"
        }));
        prune
    }

    async fn is_entry_point(
        &self,
        tree: &CallTree,
        id: NodeId,
        transcript: &mut Vec<ChatTurn>,
    ) -> bool {
        if !self.settings.early_stop_enabled {
            return false;
        }
        let function = tree.node(id).name.clone();
        transcript.push(ChatTurn::user(format!("EARLYSTOP: {}", function)));
        let judgment = self
            .oracle
            .judge(&OracleRequest::EarlyStop {
                function: function.clone(),
                project: self.project.clone(),
            })
            .await;
        let entry = match judgment {
            Judgment::Verdict(entry) => entry,
            other => {
                warn!(session = %self.session, %function, "early-stop judgment unavailable ({:?})", other);
                false
            }
        };
        transcript.push(ChatTurn::assistant(if entry {
            "entry point"
        } else {
            "not entry point"
        }));
        if !entry {
            return false;
        }

        match (self.settings.confirm_entry_points, self.confirmer) {
            (true, Some(confirmer)) => {
                let chain = ChainPath {
                    names: tree.path_names(id),
                    bodies: self.chain(tree, id, true).bodies,
                };
                let confirmed = confirmer.confirm(&chain).await;
                if !confirmed {
                    info!(session = %self.session, %function, "entry point not confirmed, continuing");
                }
                confirmed
            }
            _ => true,
        }
    }

    async fn slice(
        &self,
        tree: &CallTree,
        id: NodeId,
        transcript: &mut Vec<ChatTurn>,
    ) -> Result<String, BuildAbort> {
        let node = tree.node(id);
        let body = node.body.clone().unwrap_or_else(|| node.name.clone());
        if !self.settings.code_slice_enabled
            || body.trim().lines().count() <= self.settings.slice_min_lines
        {
            return Ok(body);
        }

        transcript.push(ChatTurn::user(format!("CODESLICE: {}", body)));
        let request = OracleRequest::CodeSlice {
            chain: self.chain(tree, id, false),
            body: body.clone(),
        };
        match self.oracle.judge(&request).await {
            Judgment::Text(reduced) => {
                transcript.push(ChatTurn::assistant(reduced.as_str()));
                Ok(reduced)
            }
            Judgment::SizeExceeded => Err(BuildAbort::LengthExceeded {
                function: node.name.clone(),
            }),
            other => {
                warn!(session = %self.session, function = %node.name, "code slice unavailable ({:?}), keeping body", other);
                transcript.push(ChatTurn::assistant(body.as_str()));
                Ok(body)
            }
        }
    }

    async fn order(
        &self,
        tree: &CallTree,
        children: Vec<NodeId>,
        rng: &mut fastrand::Rng,
    ) -> Vec<NodeId> {
        let ordering = self.settings.ordering;
        let mut scored = Vec::with_capacity(children.len());
        for child in children {
            scored.push((child, NEUTRAL_SCORE));
        }
        if scored.len() > 1 && ordering.needs_scores() {
            for entry in scored.iter_mut() {
                entry.1 = self.rank(tree, entry.0).await;
            }
        }
        ordering.arrange(&mut scored, rng);
        if scored.len() > 1 && ordering != Ordering::Insertion {
            debug!(
                session = %self.session,
                %ordering,
                order = ?scored
                    .iter()
                    .map(|(id, score)| format!("{}={:.0}", tree.node(*id).name, score))
                    .collect::<Vec<_>>(),
                "ordered siblings"
            );
        }
        scored.into_iter().map(|(id, _)| id).collect()
    }

    async fn rank(&self, tree: &CallTree, id: NodeId) -> f64 {
        let chain = self.chain(tree, id, true);
        let request = OracleRequest::Rank {
            root: tree.node(tree.root()).name.clone(),
            node: tree.node(id).name.clone(),
            chain_bodies: chain.bodies.join("\n"),
            sink_code: self.sink_code.clone(),
        };
        match self.oracle.judge(&request).await {
            Judgment::Score(score) => score.clamp(0.0, 100.0),
            other => {
                warn!(
                    session = %self.session,
                    function = %tree.node(id).name,
                    "rank unavailable ({:?}), using neutral score",
                    other
                );
                NEUTRAL_SCORE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callers::StaticCallGraph;
    use crate::index::InMemorySymbols;
    use crate::oracle::{JudgmentKind, ScriptedOracle};
    use std::sync::Mutex;

    /// Records which functions were expanded, in order.
    struct Recording {
        graph: StaticCallGraph,
        asked: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(graph: StaticCallGraph) -> Self {
            Self {
                graph,
                asked: Mutex::new(Vec::new()),
            }
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl CallerResolver for Recording {
        fn callers(&self, name: &str) -> anyhow::Result<Vec<String>> {
            self.asked.lock().unwrap().push(name.to_string());
            self.graph.callers(name)
        }
    }

    fn settings() -> SearchConfig {
        SearchConfig {
            seed: Some(7),
            ordering: Ordering::Insertion,
            ..SearchConfig::default()
        }
    }

    /// Keeps everything, never finds an entry point.
    fn permissive() -> ScriptedOracle {
        ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } | OracleRequest::EarlyStop { .. } => {
                Some(Judgment::Verdict(false))
            }
            OracleRequest::Rank { .. } => Some(Judgment::Score(50.0)),
            _ => None,
        })
    }

    fn names(report: &BuildReport, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|id| report.tree.node(*id).name.clone()).collect()
    }

    #[tokio::test]
    async fn test_root_without_callers_is_exhausted_and_empty() {
        let oracle = permissive();
        let callers = StaticCallGraph::new();
        let symbols = InMemorySymbols::new();
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;
        assert_eq!(report.outcome, BuildOutcome::Exhausted { chains: vec![] });
    }

    #[tokio::test]
    async fn test_pruned_root_never_resolves_callers() {
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } => Some(Judgment::Verdict(true)),
            _ => None,
        });
        let callers = Recording::new(StaticCallGraph::new().with_edge("main", "sink"));
        let symbols = InMemorySymbols::new();
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;

        assert_eq!(report.outcome, BuildOutcome::Pruned);
        assert!(callers.asked().is_empty());
        assert_eq!(oracle.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_early_stop_halts_before_siblings() {
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } => Some(Judgment::Verdict(false)),
            OracleRequest::EarlyStop { function, .. } => {
                Some(Judgment::Verdict(function == "a_entry"))
            }
            _ => None,
        });
        let callers = StaticCallGraph::new()
            .with_edge("a_entry", "sink")
            .with_edge("b_other", "sink");
        let symbols = InMemorySymbols::new();
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;

        let BuildOutcome::VulPath { node } = report.outcome else {
            panic!("expected a VulPath outcome, got {:?}", report.outcome);
        };
        assert_eq!(report.tree.path_names(node), ["sink", "a_entry"]);
        let judged: Vec<String> = oracle
            .calls()
            .into_iter()
            .filter_map(|r| match r {
                OracleRequest::EarlyStop { function, .. } => Some(function),
                _ => None,
            })
            .collect();
        assert_eq!(judged, ["a_entry"]);
    }

    #[tokio::test]
    async fn test_fan_out_sample_is_capped_and_seeded() {
        let mut graph = StaticCallGraph::new();
        for i in 0..12 {
            graph.add_edge(&format!("caller{i:02}"), "sink");
        }
        let mut cfg = settings();
        cfg.max_depth = 1;
        cfg.fan_out = 5;
        let symbols = InMemorySymbols::new();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let oracle = permissive();
            let report = CallTreeBuilder::new(&cfg, &oracle, &graph, &symbols)
                .build("sink", None)
                .await;
            let children = report.tree.node(report.tree.root()).children().to_vec();
            assert_eq!(children.len(), 5);
            runs.push(names(&report, &children));
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn test_depth_bound_is_never_exceeded() {
        // A chain five deep; only three levels may be built.
        let callers = StaticCallGraph::new()
            .with_edge("f1", "sink")
            .with_edge("f2", "f1")
            .with_edge("f3", "f2")
            .with_edge("f4", "f3")
            .with_edge("f5", "f4");
        let counting = Recording::new(callers);
        let oracle = permissive();
        let symbols = InMemorySymbols::new();
        let report = CallTreeBuilder::new(&settings(), &oracle, &counting, &symbols)
            .build("sink", None)
            .await;

        let BuildOutcome::Exhausted { chains } = &report.outcome else {
            panic!("expected exhaustion");
        };
        assert_eq!(chains.len(), 1);
        assert_eq!(report.tree.path_names(chains[0]), ["sink", "f1", "f2", "f3"]);
        assert!(chains.iter().all(|c| report.tree.depth(*c) <= 3));
        // f3 sits at the bound and is never expanded
        assert_eq!(counting.asked(), ["sink", "f1", "f2"]);
    }

    #[tokio::test]
    async fn test_pruned_child_is_detached() {
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { chain } => Some(Judgment::Verdict(
                chain.names.last().map(String::as_str) == Some("bad"),
            )),
            OracleRequest::EarlyStop { .. } => Some(Judgment::Verdict(false)),
            _ => None,
        });
        let callers = StaticCallGraph::new()
            .with_edge("bad", "sink")
            .with_edge("good", "sink")
            .with_edge("deeper", "bad");
        let symbols = InMemorySymbols::new();
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;

        let root_children = report.tree.node(report.tree.root()).children().to_vec();
        assert_eq!(names(&report, &root_children), ["good"]);
        let BuildOutcome::Exhausted { chains } = &report.outcome else {
            panic!("expected exhaustion");
        };
        for leaf in chains {
            assert!(!report.tree.path_names(*leaf).contains(&"bad".to_string()));
        }
    }

    #[tokio::test]
    async fn test_rank_orders_queue_and_defaults_to_neutral() {
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } | OracleRequest::EarlyStop { .. } => {
                Some(Judgment::Verdict(false))
            }
            OracleRequest::Rank { node, .. } => match node.as_str() {
                "low" => Some(Judgment::Score(10.0)),
                "high" => Some(Judgment::Score(90.0)),
                _ => Some(Judgment::Unavailable("no score".into())),
            },
            _ => None,
        });
        let callers = Recording::new(
            StaticCallGraph::new()
                .with_edge("low", "sink")
                .with_edge("high", "sink")
                .with_edge("mid", "sink"),
        );
        let symbols = InMemorySymbols::new();
        let mut cfg = settings();
        cfg.ordering = Ordering::ScoreDescending;
        cfg.max_depth = 2;
        let report = CallTreeBuilder::new(&cfg, &oracle, &callers, &symbols)
            .build("sink", None)
            .await;

        // mid could not be scored and lands between the two ranked callers
        assert_eq!(callers.asked(), ["sink", "high", "mid", "low"]);
        assert_eq!(oracle.count(JudgmentKind::Rank), 3);
        assert!(matches!(report.outcome, BuildOutcome::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_oversized_slice_aborts_build() {
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } => Some(Judgment::Verdict(false)),
            OracleRequest::CodeSlice { .. } => Some(Judgment::SizeExceeded),
            _ => None,
        });
        let callers = StaticCallGraph::new().with_edge("main", "sink");
        let long_body = (0..40).map(|i| format!("line {i};\n")).collect::<String>();
        let symbols = InMemorySymbols::new().with("sink", &long_body);
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;
        assert_eq!(
            report.outcome,
            BuildOutcome::LengthExceeded {
                function: "sink".into()
            }
        );
    }

    #[tokio::test]
    async fn test_short_bodies_skip_code_slice() {
        let oracle = permissive();
        let callers = StaticCallGraph::new().with_edge("main", "sink");
        let symbols = InMemorySymbols::new().with("sink", "int sink(void)\n{\n    return 0;\n}\n");
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;
        assert_eq!(oracle.count(JudgmentKind::CodeSlice), 0);
        assert!(matches!(report.outcome, BuildOutcome::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_ancestor_callers_are_skipped() {
        let oracle = permissive();
        // Mutual recursion between sink and helper
        let callers = StaticCallGraph::new()
            .with_edge("helper", "sink")
            .with_edge("sink", "helper");
        let symbols = InMemorySymbols::new();
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .build("sink", None)
            .await;
        let BuildOutcome::Exhausted { chains } = &report.outcome else {
            panic!("expected exhaustion");
        };
        assert_eq!(chains.len(), 1);
        assert_eq!(report.tree.path_names(chains[0]), ["sink", "helper"]);
    }

    struct Rejecting;

    impl EntryConfirmer for Rejecting {
        fn confirm<'a>(
            &'a self,
            _chain: &'a ChainPath,
        ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
            Box::pin(async { false })
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_entry_point_continues_search() {
        let oracle = ScriptedOracle::new(|req| match req {
            OracleRequest::Prune { .. } => Some(Judgment::Verdict(false)),
            OracleRequest::EarlyStop { .. } => Some(Judgment::Verdict(true)),
            _ => None,
        });
        let callers = StaticCallGraph::new().with_edge("main", "sink");
        let symbols = InMemorySymbols::new();
        let confirmer = Rejecting;
        let report = CallTreeBuilder::new(&settings(), &oracle, &callers, &symbols)
            .with_confirmer(&confirmer)
            .build("sink", None)
            .await;
        let BuildOutcome::Exhausted { chains } = &report.outcome else {
            panic!("expected exhaustion, got {:?}", report.outcome);
        };
        assert_eq!(names(&report, chains), ["main"]);
    }
}
