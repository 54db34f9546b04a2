use super::client::ChatClient;
use super::models::Usage;
use super::parse::{
    contains_marker, estimate_conversation_tokens, last_marked_block, parse_score,
    parse_tool_invocation, strip_markdown_fences,
};
use super::prompts::{self, render};
use super::{ChatTurn, Judgment, Oracle, OracleRequest};
use crate::config::Config;
use crate::error::OracleError;
use crate::store::{keys, CounterStore};
use crate::util::head_chars;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Agent conversations run slightly warm; every classification runs at the
/// configured temperature.
const RESPOND_TEMPERATURE: f32 = 0.3;

/// Repair prompts never carry more than this much of the broken reply.
const REPAIR_INPUT_LIMIT: usize = 4000;

/// [`Oracle`] backed by a chat-completions model.
pub struct LlmOracle {
    client: ChatClient,
    store: Option<Arc<dyn CounterStore>>,
    ceiling: usize,
    temperature: f32,
    summary_model: String,
    source: String,
    binary: String,
}

impl LlmOracle {
    pub fn new(client: ChatClient, ceiling: usize) -> Self {
        let summary_model = client.default_model().to_string();
        Self {
            client,
            store: None,
            ceiling,
            temperature: 0.0,
            summary_model,
            source: String::new(),
            binary: String::new(),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut oracle = Self::new(
            ChatClient::from_config(config)?,
            config.oracle.context_token_ceiling,
        );
        oracle.temperature = config.oracle.temperature;
        oracle.summary_model = config.oracle.summary_model.clone();
        oracle.source = config.project.source_path.display().to_string();
        oracle.binary = config.project.binary_path.display().to_string();
        Ok(oracle)
    }

    /// Charge token usage to the session's `TokenCount`.
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn is_available(&self) -> bool {
        self.client.is_available()
    }

    async fn complete(
        &self,
        messages: Vec<ChatTurn>,
        model: Option<&str>,
        temperature: f32,
        json_mode: bool,
    ) -> Result<String, OracleError> {
        let estimated = estimate_conversation_tokens(&messages);
        if estimated > self.ceiling {
            return Err(OracleError::SizeExceeded {
                estimated,
                ceiling: self.ceiling,
            });
        }
        let response = self
            .client
            .chat(&messages, model, temperature, json_mode)
            .await?;
        self.record_usage(response.usage.as_ref());
        Ok(response.content)
    }

    fn record_usage(&self, usage: Option<&Usage>) {
        let (Some(store), Some(usage)) = (&self.store, usage) else {
            return;
        };
        if let Err(err) = store.add_f64(keys::TOKEN_COUNT, f64::from(usage.billable_tokens())) {
            warn!("failed to record token usage: {}", err);
        }
    }

    async fn classify(&self, system: &str, user: String) -> Result<String, OracleError> {
        self.complete(
            vec![ChatTurn::system(system), ChatTurn::user(user)],
            None,
            self.temperature,
            false,
        )
        .await
    }

    /// Ask the model to fix JSON it produced.
    async fn repair_json(
        &self,
        hint: &str,
        response: &str,
        error: &str,
    ) -> Result<String, OracleError> {
        let user = render(
            prompts::JSON_REPAIR_USER,
            &[
                ("hint", hint),
                ("error", error),
                ("response", head_chars(response, REPAIR_INPUT_LIMIT)),
            ],
        );
        self.complete(
            vec![
                ChatTurn::system(prompts::JSON_REPAIR_SYSTEM),
                ChatTurn::user(user),
            ],
            None,
            0.0,
            true,
        )
        .await
    }

    async fn next_tool(&self, response: &str) -> Result<Judgment, OracleError> {
        let user = render(
            prompts::TOOL_EXTRACTION_USER,
            &[
                ("source", &self.source),
                ("binary", &self.binary),
                ("response", response),
            ],
        );
        let reply = self.classify(prompts::TOOL_EXTRACTION_SYSTEM, user).await?;
        let error = match parse_tool_invocation(&reply) {
            Ok(invocation) => return Ok(Judgment::ToolCall(invocation)),
            Err(err) => err,
        };

        debug!("tool call did not parse ({}), asking for a repair", error);
        let repaired = self
            .repair_json("tool call", &reply, &error.to_string())
            .await?;
        Ok(match parse_tool_invocation(&repaired) {
            Ok(invocation) => Judgment::ToolCall(invocation),
            Err(err) => Judgment::Unavailable(format!("invalid tool command: {}", err)),
        })
    }

    async fn judge_inner(&self, request: &OracleRequest) -> Result<Judgment, OracleError> {
        match request {
            OracleRequest::Prune { chain } => {
                let user = render(
                    prompts::PRUNE_USER,
                    &[
                        ("description", &chain.description),
                        ("call_line", &chain.call_line()),
                        ("bodies", &chain.joined_bodies()),
                    ],
                );
                let reply = self.classify(prompts::PRUNE_SYSTEM, user).await?;
                Ok(interpret(request, &reply))
            }
            OracleRequest::EarlyStop { function, project } => {
                let user = render(
                    prompts::EARLY_STOP_USER,
                    &[("function", function), ("project", project)],
                );
                let reply = self.classify(prompts::EARLY_STOP_SYSTEM, user).await?;
                Ok(interpret(request, &reply))
            }
            OracleRequest::CodeSlice { chain, body } => {
                let user = render(
                    prompts::CODE_SLICE_USER,
                    &[
                        ("description", &chain.description),
                        ("call_line", &chain.call_line()),
                        ("bodies", &chain.joined_bodies()),
                        ("body", body),
                    ],
                );
                let reply = self.classify(prompts::CODE_SLICE_SYSTEM, user).await?;
                Ok(interpret(request, &reply))
            }
            OracleRequest::Rank {
                root,
                node,
                chain_bodies,
                sink_code,
            } => {
                let user = render(
                    prompts::RANK_USER,
                    &[
                        ("root", root),
                        ("node", node),
                        ("chain_bodies", chain_bodies),
                        ("sink_code", sink_code),
                    ],
                );
                let reply = self.classify(prompts::RANK_SYSTEM, user).await?;
                Ok(interpret(request, &reply))
            }
            OracleRequest::NextTool { response } => self.next_tool(response).await,
            OracleRequest::Respond { system, history } => {
                let mut messages = Vec::with_capacity(history.len() + 1);
                messages.push(ChatTurn::system(system.as_str()));
                messages.extend(history.iter().cloned());
                let reply = self
                    .complete(messages, None, RESPOND_TEMPERATURE, false)
                    .await?;
                Ok(Judgment::Text(reply))
            }
            OracleRequest::Summarize { transcript } => {
                let reply = self
                    .complete(
                        vec![
                            ChatTurn::system(prompts::SUMMARY_SYSTEM),
                            ChatTurn::user(transcript.as_str()),
                        ],
                        Some(&self.summary_model),
                        self.temperature,
                        false,
                    )
                    .await?;
                Ok(Judgment::Text(format!("{}{}", prompts::SUMMARY_PREFIX, reply)))
            }
        }
    }
}

/// Turn a classification reply into a judgment.
fn interpret(request: &OracleRequest, reply: &str) -> Judgment {
    match request {
        OracleRequest::Prune { .. } => Judgment::Verdict(contains_marker(reply, "no vulnerability")),
        OracleRequest::EarlyStop { .. } => Judgment::Verdict(reply.contains("@@@entry point@@@")),
        OracleRequest::CodeSlice { body, .. } => Judgment::Text(
            last_marked_block(reply)
                .map(str::to_string)
                .unwrap_or_else(|| body.clone()),
        ),
        OracleRequest::Rank { .. } => match parse_score(reply) {
            Some(score) => Judgment::Score(score),
            None => Judgment::Unavailable(format!(
                "no score in reply: {}",
                head_chars(strip_markdown_fences(reply), 200)
            )),
        },
        _ => Judgment::Text(reply.to_string()),
    }
}

impl Oracle for LlmOracle {
    fn judge<'a>(
        &'a self,
        request: &'a OracleRequest,
    ) -> Pin<Box<dyn Future<Output = Judgment> + Send + 'a>> {
        Box::pin(async move {
            match self.judge_inner(request).await {
                Ok(judgment) => judgment,
                Err(OracleError::SizeExceeded { estimated, ceiling }) => {
                    warn!(
                        kind = ?request.kind(),
                        estimated, ceiling, "request exceeds the context ceiling"
                    );
                    Judgment::SizeExceeded
                }
                Err(err) => {
                    warn!(kind = ?request.kind(), "oracle degraded: {}", err);
                    Judgment::Unavailable(err.to_string())
                }
            }
        })
    }
}
