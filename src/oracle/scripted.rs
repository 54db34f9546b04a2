use super::{Judgment, JudgmentKind, Oracle, OracleRequest};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

type Rule = Box<dyn Fn(&OracleRequest) -> Option<Judgment> + Send + Sync>;

/// Deterministic oracle for tests and benchmarks.
///
/// Queued judgments for a kind are served first, in order. After that the
/// rule decides; requests it does not answer get `Unavailable`.
pub struct ScriptedOracle {
    rule: Rule,
    queue: Mutex<HashMap<JudgmentKind, VecDeque<Judgment>>>,
    calls: Mutex<Vec<OracleRequest>>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new(|_| None)
    }
}

impl ScriptedOracle {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&OracleRequest) -> Option<Judgment> + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            queue: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, kind: JudgmentKind, judgment: Judgment) -> &Self {
        if let Ok(mut queue) = self.queue.lock() {
            queue.entry(kind).or_default().push_back(judgment);
        }
        self
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<OracleRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: JudgmentKind) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.kind() == kind).count())
            .unwrap_or(0)
    }

    fn answer(&self, request: &OracleRequest) -> Judgment {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let queued = self
            .queue
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(&request.kind()).and_then(VecDeque::pop_front));
        queued
            .or_else(|| (self.rule)(request))
            .unwrap_or_else(|| Judgment::Unavailable("unscripted request".to_string()))
    }
}

impl Oracle for ScriptedOracle {
    fn judge<'a>(
        &'a self,
        request: &'a OracleRequest,
    ) -> Pin<Box<dyn Future<Output = Judgment> + Send + 'a>> {
        Box::pin(async move { self.answer(request) })
    }
}
