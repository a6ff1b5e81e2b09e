//! Multi-Agent Orchestrator (spec.md §4.12). Decides whether a turn needs
//! a single VizQL-graph run or a multi-step plan, then executes the plan
//! wave-by-wave: every currently-runnable step (all its `depends_on`
//! resolved) runs concurrently, results are fused, and the next wave is
//! promoted. A hard cycle in the plan is detected via Kahn's algorithm;
//! whatever remains unreachable is linearized in original order rather
//! than dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::config::GraphBudgetsConfig;
use crate::models::vizql::{AgentType, ConversationMessage, MultiAgentPlan, PlanStep, QueryResult, VDSQuery, VizQLGraphState};
use crate::services::bi::SharedBiClient;
use crate::services::llm::{ChatMessage, ChatOptions, LLMService};
use crate::services::schema::SchemaEnricher;
use crate::services::vizql::{GraphError, GraphRuntime, RunContext};
use crate::services::vizql::cache::FingerprintCache;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("planning failed: {0}")]
    PlanningFailed(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// The fused answer plus, in single-agent mode only, the query that
/// produced it - fusing `vizql_query`/`query_results` across multiple
/// plan steps would be ambiguous, so multi-agent turns leave them unset
/// (spec.md §6 persisted-state consumers only need the answer text then).
pub struct TurnOutcome {
    pub answer: String,
    pub vizql_query: Option<VDSQuery>,
    pub query_results: Option<QueryResult>,
}

/// The outcome of running a single plan step, tagged with which step it
/// satisfied so fuse() can order and header them.
struct StepOutcome {
    step_index: usize,
    agent_type: AgentType,
    text: String,
    query_draft: Option<VDSQuery>,
    query_results: Option<QueryResult>,
}

pub struct Orchestrator {
    bi: SharedBiClient,
    llm: Arc<dyn LLMService>,
    schema: Arc<SchemaEnricher>,
    cache: FingerprintCache,
    budgets: GraphBudgetsConfig,
}

impl Orchestrator {
    pub fn new(
        bi: SharedBiClient,
        llm: Arc<dyn LLMService>,
        schema: Arc<SchemaEnricher>,
        cache: FingerprintCache,
        budgets: GraphBudgetsConfig,
    ) -> Self {
        Self { bi, llm, schema, cache, budgets }
    }

    /// Runs a turn end to end: classifies single- vs multi-agent, then
    /// executes accordingly, returning the fused natural-language answer.
    pub async fn run_turn(
        &self,
        user_query: &str,
        context_datasources: Vec<String>,
        messages: Vec<ConversationMessage>,
    ) -> Result<TurnOutcome, OrchestratorError> {
        if self.needs_multi_agent(user_query, &context_datasources).await? {
            let plan = self.plan(user_query, &context_datasources).await?;
            self.run_plan(plan, &context_datasources, &messages).await
        } else {
            let ctx = self.run_context();
            let state = VizQLGraphState::new(user_query, context_datasources, messages);
            let final_state = GraphRuntime::run(state, &ctx, |_| {}).await?;
            Ok(TurnOutcome {
                answer: final_state.final_answer.unwrap_or_else(|| "No answer was produced.".to_string()),
                vizql_query: final_state.query_draft,
                query_results: final_state.query_results,
            })
        }
    }

    fn run_context(&self) -> RunContext {
        RunContext::new(self.bi.clone(), self.llm.clone(), self.schema.clone(), self.cache.clone(), self.budgets.clone())
    }

    /// Meta-selector LLM call: multi-agent is chosen when the query needs
    /// both query + summarize stages explicitly, or spans multiple
    /// datasources (spec.md §4.12).
    async fn needs_multi_agent(&self, user_query: &str, context_datasources: &[String]) -> Result<bool, OrchestratorError> {
        if context_datasources.len() > 1 {
            return Ok(true);
        }

        let messages = vec![
            ChatMessage::system(
                "Classify whether answering this question requires multiple independent sub-tasks \
                 (e.g. querying more than one thing and then comparing, or querying then separately \
                 summarizing across distinct scopes). Respond with exactly one word: SINGLE or MULTI.",
            ),
            ChatMessage::user(user_query.to_string()),
        ];

        let completion = self
            .llm
            .chat(&messages, &ChatOptions::default())
            .await
            .map_err(|e| OrchestratorError::PlanningFailed(e.to_string()))?;

        Ok(completion.content.to_uppercase().contains("MULTI"))
    }

    async fn plan(&self, user_query: &str, context_datasources: &[String]) -> Result<MultiAgentPlan, OrchestratorError> {
        let messages = vec![
            ChatMessage::system(
                "Produce a JSON plan for answering this multi-part question. Respond with a JSON object \
                 {\"steps\": [{\"agent_type\": \"vizql\"|\"summary\", \"action\": \"...\", \"depends_on\": [indices] | null}]}. \
                 Steps with no depends_on run first; a step with depends_on waits for those step indices to finish.",
            ),
            ChatMessage::user(format!("Question: {}\nDatasources in scope: {:?}", user_query, context_datasources)),
        ];

        let completion = self
            .llm
            .chat(&messages, &ChatOptions { json_mode: true, ..Default::default() })
            .await
            .map_err(|e| OrchestratorError::PlanningFailed(e.to_string()))?;

        serde_json::from_str(&completion.content).map_err(|e| OrchestratorError::PlanningFailed(format!("invalid plan JSON: {}", e)))
    }

    async fn run_plan(
        &self,
        plan: MultiAgentPlan,
        context_datasources: &[String],
        messages: &[ConversationMessage],
    ) -> Result<TurnOutcome, OrchestratorError> {
        let order = Self::linearize(&plan.steps);
        let mut done: HashSet<usize> = HashSet::new();
        let mut outcomes: Vec<StepOutcome> = Vec::new();
        let mut remaining: VecDeque<usize> = order.into_iter().collect();

        while !remaining.is_empty() {
            let runnable: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&idx| plan.steps[idx].depends_on.as_ref().map(|deps| deps.iter().all(|d| done.contains(d))).unwrap_or(true))
                .collect();

            if runnable.is_empty() {
                // Shouldn't happen after linearize(), but guards against a
                // plan that still deadlocks a wave - run the next step
                // regardless rather than looping forever.
                if let Some(&next) = remaining.front() {
                    remaining.retain(|&i| i != next);
                    let outcome = self.run_step(next, &plan.steps[next], context_datasources, messages, &outcomes).await?;
                    done.insert(next);
                    outcomes.push(outcome);
                }
                continue;
            }

            remaining.retain(|idx| !runnable.contains(idx));

            let wave = join_all(runnable.iter().map(|&idx| self.run_step(idx, &plan.steps[idx], context_datasources, messages, &outcomes)));
            for result in wave.await {
                let outcome = result?;
                done.insert(outcome.step_index);
                outcomes.push(outcome);
            }
        }

        outcomes.sort_by_key(|o| o.step_index);

        // A single-step plan still has an unambiguous query/result pair to
        // surface; fusing two or more makes attributing either to "the"
        // query meaningless, so multi-step plans leave them unset.
        let (vizql_query, query_results) = match outcomes.len() {
            1 => (outcomes[0].query_draft.clone(), outcomes[0].query_results.clone()),
            _ => (None, None),
        };

        Ok(TurnOutcome { answer: Self::fuse(outcomes), vizql_query, query_results })
    }

    async fn run_step(
        &self,
        step_index: usize,
        step: &PlanStep,
        context_datasources: &[String],
        messages: &[ConversationMessage],
        prior: &[StepOutcome],
    ) -> Result<StepOutcome, OrchestratorError> {
        let mut query = step.action.clone();
        if let Some(deps) = &step.depends_on {
            for &dep in deps {
                if let Some(outcome) = prior.iter().find(|o| o.step_index == dep) {
                    query.push_str(&format!("\n\nContext from a prior step: {}", outcome.text));
                }
            }
        }
        if let Some(input) = &step.input_data {
            query.push_str(&format!("\n\n{}", input));
        }

        let ctx = self.run_context();
        let state = VizQLGraphState::new(query, context_datasources.to_vec(), messages.to_vec());
        let final_state = GraphRuntime::run(state, &ctx, |_| {}).await?;

        Ok(StepOutcome {
            step_index,
            agent_type: step.agent_type,
            text: final_state.final_answer.unwrap_or_else(|| "No answer was produced.".to_string()),
            query_draft: final_state.query_draft,
            query_results: final_state.query_results,
        })
    }

    /// Returns step indices in an order where every step's dependencies
    /// precede it. Cycles (detected via Kahn's algorithm - nodes with no
    /// zero-indegree left) are broken by appending the unreachable
    /// remainder in original order rather than failing the whole plan
    /// (spec.md §4.12).
    fn linearize(steps: &[PlanStep]) -> Vec<usize> {
        let n = steps.len();
        let mut indegree = vec![0usize; n];
        for step in steps {
            if let Some(deps) = &step.depends_on {
                indegree[steps.iter().position(|s| std::ptr::eq(s, step)).unwrap()] = deps.len();
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut visited = HashSet::new();

        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            order.push(idx);
            for (j, step) in steps.iter().enumerate() {
                if visited.contains(&j) {
                    continue;
                }
                if let Some(deps) = &step.depends_on {
                    if deps.contains(&idx) && deps.iter().all(|d| visited.contains(d)) {
                        queue.push_back(j);
                    }
                }
            }
        }

        for i in 0..n {
            if !visited.contains(&i) {
                order.push(i);
            }
        }
        order
    }

    /// Concatenates step outputs with `[<AGENT> Agent]` headers when more
    /// than one step ran; a single step's text is returned verbatim
    /// (spec.md §4.12).
    fn fuse(outcomes: Vec<StepOutcome>) -> String {
        if outcomes.len() == 1 {
            return outcomes.into_iter().next().unwrap().text;
        }

        let mut out = String::new();
        for outcome in outcomes {
            let label = match outcome.agent_type {
                AgentType::Vizql => "VIZQL",
                AgentType::Summary => "SUMMARY",
            };
            out.push_str(&format!("[{} Agent]\n{}\n\n", label, outcome.text));
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(agent_type: AgentType, action: &str, depends_on: Option<Vec<usize>>) -> PlanStep {
        PlanStep { agent_type, action: action.to_string(), depends_on, input_data: None }
    }

    #[test]
    fn linearize_respects_dependencies() {
        let steps = vec![
            step(AgentType::Vizql, "first", None),
            step(AgentType::Vizql, "second", Some(vec![0])),
            step(AgentType::Summary, "third", Some(vec![1])),
        ];
        let order = Orchestrator::linearize(&steps);
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn linearize_handles_independent_steps_in_any_relative_order() {
        let steps = vec![step(AgentType::Vizql, "a", None), step(AgentType::Vizql, "b", None)];
        let order = Orchestrator::linearize(&steps);
        assert_eq!(order.len(), 2);
    }

    fn outcome(step_index: usize, agent_type: AgentType, text: &str) -> StepOutcome {
        StepOutcome { step_index, agent_type, text: text.to_string(), query_draft: None, query_results: None }
    }

    #[test]
    fn fuse_returns_verbatim_for_a_single_step() {
        let outcomes = vec![outcome(0, AgentType::Vizql, "42")];
        assert_eq!(Orchestrator::fuse(outcomes), "42");
    }

    #[test]
    fn fuse_headers_multiple_steps() {
        let outcomes = vec![outcome(0, AgentType::Vizql, "a"), outcome(1, AgentType::Summary, "b")];
        let fused = Orchestrator::fuse(outcomes);
        assert!(fused.contains("[VIZQL Agent]"));
        assert!(fused.contains("[SUMMARY Agent]"));
    }
}
