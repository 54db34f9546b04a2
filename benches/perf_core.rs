use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vulchain::callers::StaticCallGraph;
use vulchain::config::SearchConfig;
use vulchain::index::{InMemorySymbols, SymbolIndex};
use vulchain::oracle::{Judgment, OracleRequest, ScriptedOracle};
use vulchain::search::CallTreeBuilder;

/// Every function at depth `d` is called by `fan_in` functions at depth `d + 1`.
fn synthetic_graph(depth: usize, fan_in: usize) -> (StaticCallGraph, InMemorySymbols) {
    let mut graph = StaticCallGraph::new();
    let mut symbols = InMemorySymbols::new().with("sink", "void sink(char *p) { p[8] = 0; }");
    let mut level = vec!["sink".to_string()];
    for d in 1..=depth {
        let mut next = Vec::with_capacity(level.len() * fan_in);
        for callee in &level {
            for i in 0..fan_in {
                let caller = format!("{callee}_d{d}_{i}");
                graph.add_edge(&caller, callee);
                symbols = symbols.with(&caller, &format!("void {caller}(void) {{ {callee}(0); }}"));
                next.push(caller);
            }
        }
        level = next;
    }
    (graph, symbols)
}

fn bench_tree_build(c: &mut Criterion) {
    let (graph, symbols) = synthetic_graph(3, 8);
    let oracle = ScriptedOracle::new(|req| match req {
        OracleRequest::Prune { .. } | OracleRequest::EarlyStop { .. } => {
            Some(Judgment::Verdict(false))
        }
        OracleRequest::Rank { node, .. } => Some(Judgment::Score((node.len() % 100) as f64)),
        _ => None,
    });
    let config = SearchConfig {
        seed: Some(11),
        ..SearchConfig::default()
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    c.bench_function("call_tree_build_depth3_fan8", |b| {
        b.iter(|| {
            let builder = CallTreeBuilder::new(&config, &oracle, &graph, &symbols);
            let report = runtime.block_on(builder.build("sink", None));
            black_box(report.tree.leaves().len());
        });
    });
}

fn bench_symbol_index(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    for i in 0..200 {
        let path = temp.path().join(format!("unit_{i:03}.c"));
        let mut source = String::new();
        for j in 0..10 {
            source.push_str(&format!(
                "static int f{i}_{j}(int x) {{\n    if (x > {j}) {{\n        return x * {i};\n    }}\n    return 0;\n}}\n\n"
            ));
        }
        std::fs::write(path, source).expect("write synthetic source");
    }

    c.bench_function("symbol_index_build_2000_fns", |b| {
        b.iter(|| {
            let index = SymbolIndex::build(temp.path()).expect("index build");
            black_box(index.len());
        });
    });

    let index = SymbolIndex::build(temp.path()).expect("index build");
    c.bench_function("symbol_index_lookup", |b| {
        b.iter(|| black_box(index.lookup(black_box("f150_7"))));
    });
}

criterion_group!(perf_core, bench_tree_build, bench_symbol_index);
criterion_main!(perf_core);
