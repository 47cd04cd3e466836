use serde_json::{Value, json};
use tracehook::{
    EXCEPTION_EVENT, EXCEPTION_MESSAGE, InstrumentOptions, SpanData, SpanKind, SpanStatus,
    UnitMetadata, attributes,
};
use tracehook_testing::{MockGraph, NodeError, TestHarness, assert_child_of};

fn attr<'a>(span: &'a SpanData, key: &str) -> Option<&'a str> {
    span.attribute(key).and_then(|a| a.as_str())
}

fn output_of(span: &SpanData) -> Value {
    serde_json::from_str(attr(span, attributes::OUTPUT_VALUE).unwrap()).unwrap()
}

#[test]
fn test_three_step_chain_with_truncated_output() {
    let h = TestHarness::with_options(
        "scenario-chain",
        InstrumentOptions::new().with_max_state_size(10),
    );
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("step_one", |_, _| Ok(json!("abc")))
        .add_node("step_two", |_, _| Ok(json!("def")))
        .add_node("step_three", |_, _| Ok(json!("x".repeat(18))))
        .build();

    let result = graph.invoke(json!("")).unwrap();
    assert_eq!(result, json!("x".repeat(18)));

    // Three node spans finish before the chain span.
    let names: Vec<String> = h.recorder.spans().into_iter().map(|s| s.name).collect();
    assert_eq!(names, ["step_one", "step_two", "step_three", "pipeline"]);

    let chain = h.recorder.span("pipeline").unwrap();
    assert_eq!(chain.kind, SpanKind::Chain);
    assert!(chain.parent_id.is_none());
    assert_eq!(h.recorder.children_of(chain.id).len(), 3);

    for name in ["step_one", "step_two", "step_three"] {
        assert_child_of!(h.recorder, name, "pipeline");
        let span = h.recorder.span(name).unwrap();
        assert_eq!(span.status, SpanStatus::Ok);
        assert!(span.is_finished());
        assert_eq!(attr(&span, attributes::NODE_NAME), Some(name));
        assert_eq!(
            attr(&span, attributes::OUTPUT_MIME_TYPE),
            Some("application/json")
        );
        assert_eq!(
            span.attribute("graph.name").and_then(|a| a.as_str()),
            Some("pipeline")
        );
    }

    let step_one = h.recorder.span("step_one").unwrap();
    assert_eq!(attr(&step_one, attributes::INPUT_VALUE), Some("\"\""));
    assert_eq!(attr(&step_one, attributes::OUTPUT_VALUE), Some("\"abc\""));
    let step_two = h.recorder.span("step_two").unwrap();
    assert_eq!(attr(&step_two, attributes::INPUT_VALUE), Some("\"abc\""));
    assert_eq!(attr(&step_two, attributes::OUTPUT_VALUE), Some("\"def\""));

    let marker = json!({"truncated": true, "original_size": 20, "limit": 10});
    let step_three = h.recorder.span("step_three").unwrap();
    assert_eq!(output_of(&step_three), marker);
    assert_eq!(output_of(&chain), marker);
}

#[test]
fn test_nested_failure_caught_by_parent() {
    let h = TestHarness::new("scenario-nested");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("supervisor", |graph, input| {
            match graph.run_node("flaky_tool", input) {
                Ok(v) => Ok(v),
                Err(_) => Ok(json!("fallback")),
            }
        })
        .add_subnode("flaky_tool", |_, _| {
            Err(NodeError::failed("flaky_tool", "rate limited"))
        })
        .build();

    assert_eq!(graph.invoke(json!("go")).unwrap(), json!("fallback"));
    assert_eq!(h.recorder.len(), 3);

    assert_child_of!(h.recorder, "flaky_tool", "supervisor");
    assert_child_of!(h.recorder, "supervisor", "pipeline");

    let tool = h.recorder.span("flaky_tool").unwrap();
    assert_eq!(tool.kind, SpanKind::Tool);
    assert_eq!(
        tool.status,
        SpanStatus::Error {
            message: "Node 'flaky_tool' failed: rate limited".to_string()
        }
    );
    assert_eq!(tool.events.len(), 1);
    assert_eq!(tool.events[0].name, EXCEPTION_EVENT);
    assert_eq!(
        tool.events[0]
            .attribute(EXCEPTION_MESSAGE)
            .and_then(|a| a.as_str()),
        Some("Node 'flaky_tool' failed: rate limited")
    );
    assert!(tool.attribute(attributes::OUTPUT_VALUE).is_none());

    let supervisor = h.recorder.span("supervisor").unwrap();
    assert_eq!(supervisor.status, SpanStatus::Ok);
    assert_eq!(output_of(&supervisor), json!("fallback"));
    assert_eq!(h.recorder.span("pipeline").unwrap().status, SpanStatus::Ok);
}

#[test]
fn test_errors_reach_the_caller_unchanged() {
    let h = TestHarness::new("scenario-transparent");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("fetch", |_, v| Ok(v))
        .add_node("parse", |_, _| Err(NodeError::failed("parse", "bad json")))
        .add_node("store", |_, v| Ok(v))
        .build();

    let err = graph.invoke(json!("payload")).unwrap_err();
    assert_eq!(err, NodeError::failed("parse", "bad json"));

    // `store` never ran.
    assert!(h.recorder.span("store").is_none());
    assert_eq!(h.recorder.span("fetch").unwrap().status, SpanStatus::Ok);
    assert!(h.recorder.span("parse").unwrap().status.is_error());
    assert!(h.recorder.span("pipeline").unwrap().status.is_error());

    let missing = graph.run_node("nowhere", json!(null)).unwrap_err();
    assert_eq!(missing, NodeError::NotFound("nowhere".to_string()));
    assert!(h.recorder.span("nowhere").unwrap().status.is_error());
}

#[test]
fn test_classification_from_node_names() {
    let h = TestHarness::new("scenario-kinds");
    let graph = MockGraph::builder("agent_workflow", &h.framework)
        .add_node("planner_agent", |_, v| Ok(v))
        .add_node("web_search_tool", |_, v| Ok(v))
        .add_node("doc_retriever", |_, v| Ok(v))
        .add_node("call_llm", |_, v| Ok(v))
        .add_node("format", |_, v| Ok(v))
        .build();

    graph.invoke(json!({"question": "why"})).unwrap();

    let kind_of = |name: &str| h.recorder.span(name).unwrap().kind;
    // Graph-level spans are declared chains regardless of their name.
    assert_eq!(kind_of("agent_workflow"), SpanKind::Chain);
    assert_eq!(kind_of("planner_agent"), SpanKind::Agent);
    assert_eq!(kind_of("web_search_tool"), SpanKind::Tool);
    assert_eq!(kind_of("doc_retriever"), SpanKind::Retriever);
    assert_eq!(kind_of("call_llm"), SpanKind::Llm);
    assert_eq!(kind_of("format"), SpanKind::Unknown);

    let planner = h.recorder.span("planner_agent").unwrap();
    assert_eq!(attr(&planner, attributes::SPAN_KIND), Some("AGENT"));
    assert_eq!(
        attr(&planner, attributes::INPUT_VALUE),
        Some(r#"{"question":"why"}"#)
    );
}

#[test]
fn test_suppressed_region_emits_nothing() {
    let h = TestHarness::new("scenario-suppressed");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("double", |_, v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
        .build();

    let result = tracehook::suppress_instrumentation(|| graph.invoke(json!(4)));
    assert_eq!(result.unwrap(), json!(8));
    assert!(h.recorder.is_empty());
    assert!(!tracehook::is_suppressed());

    graph.invoke(json!(1)).unwrap();
    assert_eq!(h.recorder.len(), 2);
}

#[test]
fn test_session_identifiers_on_every_span() {
    let h = TestHarness::new("scenario-session");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("greet", |_, _| Ok(json!("hello")))
        .build();

    tracehook::set_session_context("session-7", Some("thread-a".to_string()));
    graph.invoke(json!(null)).unwrap();

    // A missing thread id keeps the previous one.
    tracehook::set_session_context("session-8", None);
    graph.invoke(json!(null)).unwrap();

    tracehook::clear_session_context();
    graph.invoke(json!(null)).unwrap();

    let spans = h.recorder.spans();
    assert_eq!(spans.len(), 6);
    for span in &spans[0..2] {
        assert_eq!(attr(span, attributes::SESSION_ID), Some("session-7"));
        assert_eq!(attr(span, attributes::THREAD_ID), Some("thread-a"));
    }
    for span in &spans[2..4] {
        assert_eq!(attr(span, attributes::SESSION_ID), Some("session-8"));
        assert_eq!(attr(span, attributes::THREAD_ID), Some("thread-a"));
    }
    for span in &spans[4..] {
        assert!(span.attribute(attributes::SESSION_ID).is_none());
        assert!(span.attribute(attributes::THREAD_ID).is_none());
    }
}

#[test]
fn test_state_capture_can_be_disabled() {
    let h = TestHarness::with_options(
        "scenario-no-state",
        InstrumentOptions::new().with_capture_state(false),
    );
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("echo", |_, v| Ok(v))
        .build();

    graph.invoke(json!("secret")).unwrap();
    for span in h.recorder.spans() {
        assert!(span.attribute(attributes::INPUT_VALUE).is_none());
        assert!(span.attribute(attributes::OUTPUT_VALUE).is_none());
        assert_eq!(span.status, SpanStatus::Ok);
    }
}

#[test]
fn test_callback_units_nest_under_instrumented_nodes() {
    let h = TestHarness::new("scenario-callbacks");
    let tracer = h.tracer.clone();
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("agent", move |_, v| {
            let run = uuid_like(1);
            let child = uuid_like(2);
            tracer.on_start(run, None, &UnitMetadata::new("llm_call"), &v);
            tracer.on_start(
                child,
                Some(run),
                &UnitMetadata::new("parser").with_unit_type("tool"),
                &v,
            );
            tracer.on_end(child, &json!("parsed"));
            tracer.on_end(run, &json!("answer"));
            Ok(json!("answer"))
        })
        .build();

    graph.invoke(json!("q")).unwrap();
    assert_child_of!(h.recorder, "llm_call", "agent");
    assert_child_of!(h.recorder, "parser", "llm_call");
    assert_eq!(h.recorder.span("parser").unwrap().kind, SpanKind::Tool);
    assert_eq!(h.tracer.active_runs(), 0);
}

fn uuid_like(n: u128) -> uuid::Uuid {
    uuid::Uuid::from_u128(n)
}
