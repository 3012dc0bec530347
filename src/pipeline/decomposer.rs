// src/pipeline/decomposer.rs
// Complexity-gated decomposition into dependency-ordered sub-queries

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::capabilities::llm::{CompletionRequest, LlmClient};
use crate::capabilities::structured::parse_structured;
use crate::capabilities::web::{WebClient, WebSearchRequest};
use crate::config::SibylConfig;
use crate::pipeline::dispatcher::RetrievalDispatcher;
use crate::types::{ActivityStep, Decomposition, Reference, SubQuery, WebResult};

const DECOMPOSER_SYSTEM_PROMPT: &str = "You split a complex question into independent sub-queries for retrieval. \
Each sub-query has an integer id, a focused search query, the ids it depends on, and a one-line reasoning. \
Finish with a synthesis prompt that combines the evidence.\n\
Output ONLY valid JSON:\n\
{\"sub_queries\": [{\"id\": 1, \"query\": \"...\", \"dependencies\": [], \"reasoning\": \"...\"}], \"synthesis_prompt\": \"...\"}";

const DECOMPOSER_MAX_TOKENS: u32 = 600;

#[derive(Debug, Deserialize)]
struct DecompositionOutput {
    sub_queries: Vec<SubQuery>,
    #[serde(default)]
    synthesis_prompt: String,
}

/// Evidence gathered by executing a decomposition: the deduplicated union
/// across sub-queries, plus the execution record.
#[derive(Debug, Default)]
pub struct DecompositionOutcome {
    pub decomposition: Decomposition,
    pub references: Vec<Reference>,
    pub web_results: Vec<WebResult>,
    pub activity: Vec<ActivityStep>,
    /// Sub-query ids in the order they were executed.
    pub executed: Vec<u32>,
    /// Sub-query ids skipped because a dependency never ran.
    pub skipped: Vec<u32>,
}

/// Assesses question complexity, asks the LLM for a decomposition, validates
/// it, and executes sub-queries in topological order with bounded
/// parallelism. Any validation failure abandons decomposition entirely.
pub struct QueryDecomposer {
    llm: Arc<dyn LlmClient>,
    web: Option<Arc<dyn WebClient>>,
    config: Arc<SibylConfig>,
}

impl QueryDecomposer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        web: Option<Arc<dyn WebClient>>,
        config: Arc<SibylConfig>,
    ) -> Self {
        Self { llm, web, config }
    }

    /// Keyword-and-shape heuristic for question complexity, in [0, 1].
    pub fn assess_complexity(question: &str) -> f32 {
        let q = question.to_lowercase();
        let mut score = 0.1f32;

        let comparison_markers = ["compare", " versus ", " vs ", "difference between", "trade-off", "tradeoff"];
        if comparison_markers.iter().any(|m| q.contains(m)) {
            score += 0.4;
        }

        let conjunction_count = q.matches(" and ").count() + q.matches(", ").count();
        score += 0.1 * conjunction_count.min(3) as f32;

        if q.matches('?').count() > 1 {
            score += 0.2;
        }

        if question.len() > 120 {
            score += 0.2;
        }

        score.min(1.0)
    }

    /// Decompose the question, or `None` when the model output is missing,
    /// malformed, out of bounds, or cyclic. The caller falls through to
    /// normal dispatch on `None`.
    pub async fn decompose(&self, question: &str, model: &str) -> (Option<Decomposition>, Option<String>) {
        let request = CompletionRequest::prompt(
            model,
            DECOMPOSER_SYSTEM_PROMPT,
            format!("## Question\n{question}\n\nSplit into at most {} sub-queries.", self.config.decomposition_max_subqueries),
            DECOMPOSER_MAX_TOKENS,
        )
        .with_json_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "sub_queries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "query": {"type": "string"},
                            "dependencies": {"type": "array", "items": {"type": "integer"}},
                            "reasoning": {"type": "string"}
                        },
                        "required": ["id", "query"]
                    }
                },
                "synthesis_prompt": {"type": "string"}
            },
            "required": ["sub_queries", "synthesis_prompt"]
        }));

        let output: DecompositionOutput = match self.llm.complete(request).await {
            Ok(completion) => match parse_structured(&completion.text) {
                Ok(output) => output,
                Err(e) => {
                    warn!("decomposition output malformed, abandoning: {e}");
                    return (None, Some(format!("decomposition abandoned: {e}")));
                }
            },
            Err(e) => {
                warn!("decomposition call failed, abandoning: {e}");
                return (None, Some(format!("decomposition abandoned: {e}")));
            }
        };

        let decomposition = Decomposition {
            sub_queries: output.sub_queries,
            synthesis_prompt: output.synthesis_prompt,
        };
        match validate(&decomposition, self.config.decomposition_max_subqueries) {
            Ok(()) => (Some(decomposition), None),
            Err(reason) => {
                warn!("decomposition invalid, abandoning: {reason}");
                (None, Some(format!("decomposition abandoned: {reason}")))
            }
        }
    }

    /// Execute sub-queries in topological waves. Within a wave, sub-queries
    /// run concurrently, and each one runs knowledge-base and web search in
    /// parallel under a per-step timeout. A failed sub-query contributes
    /// empty results.
    pub async fn execute(
        &self,
        decomposition: Decomposition,
        dispatcher: &RetrievalDispatcher,
    ) -> DecompositionOutcome {
        let order = match topological_order(&decomposition.sub_queries) {
            Some(order) => order,
            None => {
                // Validation already rejects cycles; guard anyway.
                return DecompositionOutcome {
                    decomposition,
                    ..Default::default()
                };
            }
        };
        let by_id: HashMap<u32, &SubQuery> = decomposition
            .sub_queries
            .iter()
            .map(|sq| (sq.id, sq))
            .collect();

        let step_timeout = Duration::from_millis(self.config.call_timeout_ms);
        let mut executed: Vec<u32> = Vec::new();
        let mut skipped: Vec<u32> = Vec::new();
        let mut activity: Vec<ActivityStep> = Vec::new();
        let mut evidence: HashMap<u32, (Vec<Reference>, Vec<WebResult>)> = HashMap::new();

        let mut remaining: Vec<u32> = order;
        while !remaining.is_empty() {
            let done: HashSet<u32> = executed.iter().copied().collect();
            let (ready, rest): (Vec<u32>, Vec<u32>) = remaining
                .into_iter()
                .partition(|id| by_id[id].dependencies.iter().all(|dep| done.contains(dep)));
            remaining = rest;

            if ready.is_empty() {
                // Everything left depends on something that never ran.
                for id in &remaining {
                    skipped.push(*id);
                    activity.push(
                        ActivityStep::new(
                            "query_decomposition",
                            format!("sub-query {id} skipped: unmet dependencies"),
                        )
                        .with_error("unmet dependencies"),
                    );
                }
                break;
            }

            let wave = futures::future::join_all(ready.iter().map(|id| {
                let sub_query = by_id[id];
                self.run_sub_query(sub_query, dispatcher, step_timeout)
            }))
            .await;

            for (id, (references, web_results, steps)) in ready.iter().zip(wave) {
                executed.push(*id);
                activity.extend(steps);
                evidence.insert(*id, (references, web_results));
            }
        }

        // Merge in execution order, deduplicating by reference id and web url.
        let mut references = Vec::new();
        let mut web_results = Vec::new();
        let mut seen_refs = HashSet::new();
        let mut seen_urls = HashSet::new();
        for id in &executed {
            if let Some((refs, webs)) = evidence.remove(id) {
                for reference in refs {
                    if seen_refs.insert(reference.id.clone()) {
                        references.push(reference);
                    }
                }
                for result in webs {
                    if seen_urls.insert(result.url.clone()) {
                        web_results.push(result);
                    }
                }
            }
        }

        debug!(
            executed = executed.len(),
            skipped = skipped.len(),
            references = references.len(),
            web = web_results.len(),
            "decomposition executed"
        );

        DecompositionOutcome {
            decomposition,
            references,
            web_results,
            activity,
            executed,
            skipped,
        }
    }

    async fn run_sub_query(
        &self,
        sub_query: &SubQuery,
        dispatcher: &RetrievalDispatcher,
        step_timeout: Duration,
    ) -> (Vec<Reference>, Vec<WebResult>, Vec<ActivityStep>) {
        let started = Instant::now();
        let mut steps = vec![ActivityStep::new(
            "query_decomposition",
            format!("sub-query {}: {}", sub_query.id, sub_query.query),
        )];

        let kb = tokio::time::timeout(step_timeout, dispatcher.search_for_subquery(&sub_query.query));
        let web = async {
            match &self.web {
                Some(web) => {
                    let request =
                        WebSearchRequest::new(&sub_query.query, self.config.web_results_max);
                    match tokio::time::timeout(step_timeout, web.search(&request)).await {
                        Ok(Ok(results)) => results,
                        Ok(Err(e)) => {
                            warn!(id = sub_query.id, "sub-query web search failed: {e}");
                            vec![]
                        }
                        Err(_) => {
                            warn!(id = sub_query.id, "sub-query web search timed out");
                            vec![]
                        }
                    }
                }
                None => vec![],
            }
        };

        let (kb_result, web_results) = tokio::join!(kb, web);
        let references = match kb_result {
            Ok((hits, chain_steps)) => {
                steps.extend(chain_steps);
                hits
            }
            Err(_) => {
                warn!(id = sub_query.id, "sub-query retrieval timed out");
                steps.push(
                    ActivityStep::new(
                        "query_decomposition",
                        format!("sub-query {} retrieval", sub_query.id),
                    )
                    .with_error("timed out"),
                );
                vec![]
            }
        };

        if let Some(first) = steps.first_mut() {
            first.duration_ms = started.elapsed().as_millis() as u64;
        }
        (references, web_results, steps)
    }
}

/// Validate bounds, id uniqueness, dependency closure and acyclicity.
fn validate(decomposition: &Decomposition, max_subqueries: usize) -> std::result::Result<(), String> {
    let sub_queries = &decomposition.sub_queries;
    if sub_queries.is_empty() {
        return Err("no sub-queries".into());
    }
    if sub_queries.len() > max_subqueries {
        return Err(format!(
            "{} sub-queries exceeds limit {max_subqueries}",
            sub_queries.len()
        ));
    }

    let mut ids = HashSet::new();
    for sub_query in sub_queries {
        if !ids.insert(sub_query.id) {
            return Err(format!("duplicate sub-query id {}", sub_query.id));
        }
    }
    for sub_query in sub_queries {
        for dep in &sub_query.dependencies {
            if !ids.contains(dep) {
                return Err(format!(
                    "sub-query {} depends on undefined id {dep}",
                    sub_query.id
                ));
            }
        }
    }

    if topological_order(sub_queries).is_none() {
        return Err("dependency cycle".into());
    }
    Ok(())
}

/// Kahn's algorithm; `None` on a cycle.
fn topological_order(sub_queries: &[SubQuery]) -> Option<Vec<u32>> {
    let mut in_degree: HashMap<u32, usize> = sub_queries.iter().map(|sq| (sq.id, 0)).collect();
    let mut dependents: HashMap<u32, Vec<u32>> = HashMap::new();
    for sub_query in sub_queries {
        for dep in &sub_query.dependencies {
            *in_degree.get_mut(&sub_query.id)? += 1;
            dependents.entry(*dep).or_default().push(sub_query.id);
        }
    }

    // Seed with zero-degree nodes in declaration order for determinism.
    let mut queue: Vec<u32> = sub_queries
        .iter()
        .filter(|sq| in_degree[&sq.id] == 0)
        .map(|sq| sq.id)
        .collect();
    let mut order = Vec::with_capacity(sub_queries.len());

    let mut cursor = 0;
    while cursor < queue.len() {
        let id = queue[cursor];
        cursor += 1;
        order.push(id);
        if let Some(children) = dependents.get(&id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(*child);
                    }
                }
            }
        }
    }

    if order.len() == sub_queries.len() {
        Some(order)
    } else {
        None
    }
}
