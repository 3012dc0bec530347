// tests/session_e2e.rs
// End-to-end session scenarios over scripted capabilities

use std::sync::Arc;

use sibyl::config::SibylConfig;
use sibyl::events::{EventSink, SessionEvent};
use sibyl::pipeline::{Orchestrator, SessionMode};
use sibyl::testing::stubs::{StubLlm, StubRetrieval, StubWeb};
use sibyl::types::{Message, Reference};

fn reference(id: &str, title: &str, content: &str, score: f32) -> Reference {
    Reference {
        id: id.into(),
        title: Some(title.into()),
        content: Some(content.into()),
        score: Some(score),
        ..Default::default()
    }
}

fn script_router(llm: &StubLlm, intent: &str, confidence: f32) {
    llm.script(
        "You classify",
        &format!(r#"{{"intent": "{intent}", "confidence": {confidence}, "reasoning": "scripted"}}"#),
    );
}

fn script_planner(llm: &StubLlm, json: &str) {
    llm.script("You plan retrieval", json);
}

fn script_synthesis(llm: &StubLlm, answer: &str) {
    llm.script("Respond using ONLY", answer);
}

fn script_critique(llm: &StubLlm, json: &str) {
    llm.script("You audit a draft", json);
}

async fn collect_events(mut rx: tokio::sync::mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn event_names(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

// ----------------------------------------------------------------------------
// Scenario 1: grounded factual answer from a single reference
// ----------------------------------------------------------------------------

#[tokio::test]
async fn grounded_factual_single_reference() {
    let config = Arc::new(SibylConfig {
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_router(&llm, "factual_lookup", 0.9);
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "capital of France", "k": 3}]}"#,
    );
    script_synthesis(&llm, "Paris is the capital of France. [1]");
    script_critique(&llm, r#"{"grounded": true, "coverage": 0.95, "issues": []}"#);

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference(
        "d1",
        "Paris",
        "Paris is the capital of France.",
        3.2,
    )]);

    let orchestrator = Orchestrator::new(config, llm, retrieval);
    let response = orchestrator
        .run_session(
            vec![Message::user("What is the capital of France?")],
            SessionMode::Sync,
            None,
            EventSink::null(),
        )
        .await
        .unwrap();

    assert!(response.answer.contains("Paris"));
    assert!(response.answer.contains("[1]"));
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].id, "d1");

    let critic_report = response.metadata.critic_report.unwrap();
    assert_eq!(critic_report.iterations, 1);
    assert!(!critic_report.critic_error);

    let retrieval_steps: Vec<_> = response
        .activity
        .iter()
        .filter(|s| s.step_type == "retrieval")
        .collect();
    assert_eq!(retrieval_steps.len(), 1);
}

// ----------------------------------------------------------------------------
// Scenario 2: insufficient evidence short-circuits synthesis
// ----------------------------------------------------------------------------

#[tokio::test]
async fn insufficient_evidence_answers_i_do_not_know() {
    let config = Arc::new(SibylConfig {
        enable_intent_routing: false,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "capital of France"}]}"#,
    );

    let retrieval = Arc::new(StubRetrieval::new());
    let web = Arc::new(StubWeb::new()); // no results scripted

    let orchestrator =
        Orchestrator::new(config, llm.clone(), retrieval).with_web(web);
    let (sink, rx) = EventSink::channel(128);
    let response = orchestrator
        .run_session(
            vec![Message::user("What is the capital of France?")],
            SessionMode::Streaming,
            None,
            sink,
        )
        .await
        .unwrap();
    let events = collect_events(rx).await;

    assert_eq!(response.answer, "I do not know.");
    assert!(response.citations.is_empty());
    assert!(response.metadata.critic_report.is_none());

    // The synthesizer was never invoked: no token events at all.
    let names = event_names(&events);
    assert!(!names.contains(&"token"));
    assert!(names.contains(&"complete"));
    assert_eq!(*names.last().unwrap(), "done");
    // Only the planner hit the LLM.
    assert_eq!(llm.call_count(), 1);
}

// ----------------------------------------------------------------------------
// Scenario 3: critic-triggered revision, then accept
// ----------------------------------------------------------------------------

#[tokio::test]
async fn critic_revision_covers_second_source() {
    let config = Arc::new(SibylConfig {
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_router(&llm, "factual_lookup", 0.8);
    script_planner(
        &llm,
        r#"{"confidence": 0.8, "steps": [{"action": "vector_search", "query": "sources"}]}"#,
    );
    script_synthesis(&llm, "Answer citing only the first source. [1]");
    script_synthesis(&llm, "Answer citing both sources. [1][2]");
    script_critique(
        &llm,
        r#"{"grounded": true, "coverage": 0.5, "issues": ["Cover second source."]}"#,
    );
    script_critique(&llm, r#"{"grounded": true, "coverage": 0.9, "issues": []}"#);

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![
        reference("d1", "First", "first source text", 3.1),
        reference("d2", "Second", "second source text", 3.0),
    ]);

    let orchestrator = Orchestrator::new(config, llm.clone(), retrieval);
    let (sink, rx) = EventSink::channel(256);
    let response = orchestrator
        .run_session(
            vec![Message::user("Summarize both sources.")],
            SessionMode::Streaming,
            None,
            sink,
        )
        .await
        .unwrap();
    let events = collect_events(rx).await;

    assert!(response.answer.contains("[1]"));
    assert!(response.answer.contains("[2]"));
    let critic_report = response.metadata.critic_report.unwrap();
    assert_eq!(critic_report.iterations, 2);
    assert_eq!(critic_report.history.len(), 2);

    // Two token bursts separated by a critique event.
    let names = event_names(&events);
    let first_token = names.iter().position(|n| *n == "token").unwrap();
    let first_critique = names.iter().position(|n| *n == "critique").unwrap();
    let last_token = names.iter().rposition(|n| *n == "token").unwrap();
    let last_critique = names.iter().rposition(|n| *n == "critique").unwrap();
    assert!(first_token < first_critique);
    assert!(first_critique < last_token);
    assert!(last_token < last_critique);

    // Revision notes from the first critique reached the second attempt.
    let synthesis_calls: Vec<_> = llm
        .calls()
        .into_iter()
        .filter(|c| c.messages.iter().any(|m| m.content.contains("Respond using ONLY")))
        .collect();
    assert_eq!(synthesis_calls.len(), 2);
    assert!(synthesis_calls[1]
        .messages
        .iter()
        .any(|m| m.content.contains("Cover second source.")));
}

// ----------------------------------------------------------------------------
// Scenario 4: lazy upgrade fires exactly once
// ----------------------------------------------------------------------------

#[tokio::test]
async fn lazy_upgrade_fires_once() {
    let config = Arc::new(SibylConfig {
        enable_lazy_retrieval: true,
        lazy_summary_max_chars: 20,
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_router(&llm, "factual_lookup", 0.8);
    script_planner(
        &llm,
        r#"{"confidence": 0.8, "steps": [{"action": "vector_search", "query": "long documents"}]}"#,
    );
    script_synthesis(&llm, "Thin draft from summaries. [1]");
    script_synthesis(&llm, "Full answer grounded in loaded content. [1][2]");
    script_critique(
        &llm,
        r#"{"grounded": true, "coverage": 0.3, "issues": ["Needs more depth."]}"#,
    );
    script_critique(&llm, r#"{"grounded": true, "coverage": 0.9, "issues": []}"#);

    let retrieval = Arc::new(StubRetrieval::new());
    let d1 = reference("d1", "One", &"alpha content ".repeat(40), 3.2);
    let d2 = reference("d2", "Two", &"beta content ".repeat(40), 3.1);
    retrieval.push_hybrid(vec![d1.clone(), d2.clone()]);
    retrieval.insert_document(d1);
    retrieval.insert_document(d2);

    let orchestrator = Orchestrator::new(config, llm, retrieval.clone());
    let (sink, rx) = EventSink::channel(256);
    let response = orchestrator
        .run_session(
            vec![Message::user("Tell me about the long documents.")],
            SessionMode::Streaming,
            None,
            sink,
        )
        .await
        .unwrap();
    let events = collect_events(rx).await;

    // Exactly one lazy_load event, upgrading both references.
    let lazy_loads: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::LazyLoad { ids, tokens_added } => Some((ids.clone(), *tokens_added)),
            _ => None,
        })
        .collect();
    assert_eq!(lazy_loads.len(), 1);
    assert_eq!(lazy_loads[0].0.len(), 2);
    assert!(lazy_loads[0].1 > 0);
    assert_eq!(retrieval.get_by_id_calls(), 2);

    // After the upgrade, citations carry the full content, not the preview.
    assert!(response.citations.iter().all(|c| {
        c.content.as_ref().map(|text| text.len() > 20).unwrap_or(false)
    }));
    assert_eq!(response.metadata.critic_report.unwrap().iterations, 2);
}

// ----------------------------------------------------------------------------
// Scenario 5: decomposed multi-part question
// ----------------------------------------------------------------------------

#[tokio::test]
async fn decomposed_question_merges_evidence_in_order() {
    let config = Arc::new(SibylConfig {
        enable_query_decomposition: true,
        enable_critic: false,
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_router(&llm, "research", 0.8);
    script_planner(
        &llm,
        r#"{"confidence": 0.8, "steps": [{"action": "vector_search", "query": "compare"}]}"#,
    );
    llm.script(
        "You split a complex question",
        r#"{"sub_queries": [
            {"id": 1, "query": "price of X", "dependencies": [], "reasoning": "price"},
            {"id": 2, "query": "price of Y", "dependencies": [], "reasoning": "price"},
            {"id": 3, "query": "features of X", "dependencies": [], "reasoning": "features"},
            {"id": 4, "query": "features of Y", "dependencies": [], "reasoning": "features"},
            {"id": 5, "query": "compare X and Y", "dependencies": [1, 2, 3, 4], "reasoning": "synthesis"}
        ], "synthesis_prompt": "Combine price and feature evidence."}"#,
    );
    script_synthesis(&llm, "X is cheaper [1] but Y has more features [2].");

    let retrieval = Arc::new(StubRetrieval::new());
    // One queue entry per sub-query; the shared document tests deduplication.
    let shared = reference("shared", "Shared", "appears in two sub-queries", 3.0);
    retrieval.push_hybrid(vec![reference("p1", "PriceX", "price of X is 10", 3.0)]);
    retrieval.push_hybrid(vec![reference("p2", "PriceY", "price of Y is 20", 3.0)]);
    retrieval.push_hybrid(vec![shared.clone()]);
    retrieval.push_hybrid(vec![shared.clone()]);
    retrieval.push_hybrid(vec![reference("cmp", "Compare", "comparison notes", 3.0)]);

    let orchestrator = Orchestrator::new(config, llm, retrieval);
    let (sink, rx) = EventSink::channel(512);
    let response = orchestrator
        .run_session(
            vec![Message::user("Compare X and Y on price and features.")],
            SessionMode::Streaming,
            None,
            sink,
        )
        .await
        .unwrap();
    let events = collect_events(rx).await;

    // The decomposition event was emitted with all five sub-queries.
    let decomposition = events.iter().find_map(|e| match e {
        SessionEvent::Decomposition { sub_queries, .. } => Some(sub_queries.clone()),
        _ => None,
    });
    assert_eq!(decomposition.unwrap().len(), 5);

    // References are the deduplicated union.
    let ids: Vec<&str> = response.citations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(ids.iter().filter(|id| **id == "shared").count(), 1);

    // The dependent sub-query's activity appears after all four independents.
    let sub_steps: Vec<&str> = response
        .activity
        .iter()
        .filter(|s| s.step_type == "query_decomposition")
        .map(|s| s.description.as_str())
        .collect();
    let position = |needle: &str| {
        sub_steps
            .iter()
            .position(|d| d.starts_with(needle))
            .unwrap_or_else(|| panic!("missing step {needle}"))
    };
    let synthesis_position = position("sub-query 5");
    for id in 1..=4 {
        assert!(position(&format!("sub-query {id}")) < synthesis_position);
    }
}

// ----------------------------------------------------------------------------
// Scenario 6: low planner confidence escalates to dual retrieval
// ----------------------------------------------------------------------------

#[tokio::test]
async fn low_confidence_plan_escalates_to_web() {
    let config = Arc::new(SibylConfig {
        enable_critic: false,
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_router(&llm, "factual_lookup", 0.8);
    // Confidence 0.30 < 0.45, and the plan asks only for vector search.
    script_planner(
        &llm,
        r#"{"confidence": 0.30, "steps": [{"action": "vector_search", "query": "niche topic"}]}"#,
    );
    script_synthesis(&llm, "Grounded answer. [1]");

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference("d1", "Doc", "niche topic text", 3.0)]);
    let web = Arc::new(StubWeb::new());
    web.add_result("w1", "Web Hit", "https://example.com/a", "web snippet");

    let orchestrator = Orchestrator::new(config, llm, retrieval).with_web(web.clone());
    let response = orchestrator
        .run_session(
            vec![Message::user("Tell me about the niche topic.")],
            SessionMode::Sync,
            None,
            EventSink::null(),
        )
        .await
        .unwrap();

    assert_eq!(web.search_call_count(), 1);
    let retrieval_meta = response.metadata.retrieval.unwrap();
    assert!(retrieval_meta.escalated);
    assert!(response
        .activity
        .iter()
        .any(|s| s.step_type == "web_search" && s.error.is_none()));
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

#[tokio::test]
async fn identical_sessions_are_deterministic() {
    async fn run_once() -> (String, Vec<String>, Vec<(String, String)>) {
        let config = Arc::new(SibylConfig {
            enable_critic: false,
            enable_intent_routing: false,
            retrieval_min_docs: 1,
            ..Default::default()
        });
        let llm = Arc::new(StubLlm::new());
        script_planner(
            &llm,
            r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "q"}]}"#,
        );
        script_synthesis(&llm, "Stable answer. [1]");

        let retrieval = Arc::new(StubRetrieval::new());
        retrieval.push_hybrid(vec![
            reference("d1", "One", "first", 3.0),
            reference("d2", "Two", "second", 2.9),
        ]);

        let orchestrator = Orchestrator::new(config, llm, retrieval);
        let response = orchestrator
            .run_session(
                vec![Message::user("q")],
                SessionMode::Sync,
                None,
                EventSink::null(),
            )
            .await
            .unwrap();

        let citations = response.citations.iter().map(|c| c.id.clone()).collect();
        let activity = response
            .activity
            .iter()
            .map(|s| (s.step_type.clone(), s.description.clone()))
            .collect();
        (response.answer, citations, activity)
    }

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn critic_loop_is_bounded() {
    let config = Arc::new(SibylConfig {
        critic_max_retries: 2,
        retrieval_min_docs: 1,
        enable_intent_routing: false,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "q"}]}"#,
    );
    script_synthesis(&llm, "Draft that never satisfies. [1]");
    // Every critique demands revision.
    script_critique(
        &llm,
        r#"{"grounded": false, "coverage": 0.2, "issues": ["Try again."]}"#,
    );

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference("d1", "Doc", "text", 3.0)]);

    let orchestrator = Orchestrator::new(config, llm, retrieval);
    let response = orchestrator
        .run_session(
            vec![Message::user("q")],
            SessionMode::Sync,
            None,
            EventSink::null(),
        )
        .await
        .unwrap();

    let critic_report = response.metadata.critic_report.unwrap();
    assert_eq!(critic_report.iterations, 3); // CRITIC_MAX_RETRIES + 1
}

#[tokio::test]
async fn citations_stay_in_range() {
    let config = Arc::new(SibylConfig {
        enable_critic: false,
        enable_intent_routing: false,
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "q"}]}"#,
    );
    // The model hallucinates a citation beyond the reference list.
    script_synthesis(&llm, "Supported [1] and invented [9].");

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference("d1", "Doc", "text", 3.0)]);

    let orchestrator = Orchestrator::new(config, llm, retrieval);
    let response = orchestrator
        .run_session(
            vec![Message::user("q")],
            SessionMode::Sync,
            None,
            EventSink::null(),
        )
        .await
        .unwrap();

    assert!(response.answer.contains("[1]"));
    assert!(!response.answer.contains("[9]"));
}

#[tokio::test]
async fn context_budget_respects_caps() {
    let config = Arc::new(SibylConfig {
        enable_critic: false,
        enable_intent_routing: false,
        retrieval_min_docs: 1,
        context_history_token_cap: 50,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    llm.script("Conversation to compress", r#"{"summary_bullets": [], "salience_notes": []}"#);
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "q"}]}"#,
    );
    script_synthesis(&llm, "Answer. [1]");

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference("d1", "Doc", "text", 3.0)]);

    let orchestrator = Orchestrator::new(config, llm, retrieval);
    let mut messages: Vec<Message> = (0..30)
        .map(|i| Message::user(format!("padding message {i} {}", "x".repeat(100))))
        .collect();
    messages.push(Message::user("q"));

    let response = orchestrator
        .run_session(messages, SessionMode::Sync, None, EventSink::null())
        .await
        .unwrap();

    let budget = response.metadata.context_budget;
    assert!(budget.history_tokens <= 50);
    assert!(budget.summary_tokens <= 600);
    assert!(budget.salience_tokens <= 400);
    assert!(budget.web_tokens <= 8000);
}

#[tokio::test]
async fn synthesis_failure_fails_session_with_terminal_events() {
    let config = Arc::new(SibylConfig {
        enable_critic: false,
        enable_intent_routing: false,
        retrieval_min_docs: 1,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "q"}]}"#,
    );
    // No synthesis script: the synthesizer exhausts retries and fails.

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference("d1", "Doc", "text", 3.0)]);

    let orchestrator = Orchestrator::new(config, llm, retrieval);
    let (sink, rx) = EventSink::channel(128);
    let result = orchestrator
        .run_session(
            vec![Message::user("q")],
            SessionMode::Streaming,
            None,
            sink,
        )
        .await;
    let events = collect_events(rx).await;

    assert!(result.is_err());
    let names = event_names(&events);
    assert!(names.contains(&"error"));
    assert_eq!(*names.last().unwrap(), "done");
    assert!(!names.contains(&"complete"));
}

#[tokio::test]
async fn memory_persists_across_turns_in_session() {
    let config = Arc::new(SibylConfig {
        enable_critic: false,
        enable_intent_routing: false,
        retrieval_min_docs: 1,
        context_max_recent_turns: 2,
        ..Default::default()
    });
    let llm = Arc::new(StubLlm::new());
    llm.script(
        "Conversation to compress",
        r#"{"summary_bullets": ["user is researching France"],
            "salience_notes": [{"fact": "interested in geography", "topic": "interests"}]}"#,
    );
    script_planner(
        &llm,
        r#"{"confidence": 0.9, "steps": [{"action": "vector_search", "query": "q"}]}"#,
    );
    script_synthesis(&llm, "Answer. [1]");

    let retrieval = Arc::new(StubRetrieval::new());
    retrieval.push_hybrid(vec![reference("d1", "Doc", "text", 3.0)]);

    let orchestrator = Orchestrator::new(config, llm.clone(), retrieval.clone());
    let messages: Vec<Message> = vec![
        Message::user("older turn one"),
        Message::assistant("older reply"),
        Message::user("What about France?"),
    ];
    orchestrator
        .run_session(messages.clone(), SessionMode::Sync, Some("s1".into()), EventSink::null())
        .await
        .unwrap();

    // A later session under the same id sees the stored summary in the
    // planner's conversation context.
    retrieval.push_hybrid(vec![reference("d1", "Doc", "text", 3.0)]);
    orchestrator
        .run_session(messages, SessionMode::Sync, Some("s1".into()), EventSink::null())
        .await
        .unwrap();

    let planner_inputs: Vec<String> = llm
        .calls()
        .into_iter()
        .filter(|c| c.messages.iter().any(|m| m.content.contains("You plan retrieval")))
        .map(|c| {
            c.messages
                .iter()
                .map(|m| m.content.clone())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect();
    assert_eq!(planner_inputs.len(), 2);
    assert!(planner_inputs[1].contains("user is researching France"));
}
