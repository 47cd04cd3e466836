use serde_json::{Value, json};
use std::time::Duration;
use tracehook::{SpanData, SpanStatus, attributes, propagator};
use tracehook_testing::{MockGraph, NodeError, TestHarness, assert_child_of};

fn session_of(span: &SpanData) -> Option<&str> {
    span.attribute(attributes::SESSION_ID).and_then(|a| a.as_str())
}

fn input_of(span: &SpanData) -> Value {
    span.attribute(attributes::INPUT_VALUE)
        .and_then(|a| a.as_str())
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_active_span_survives_await_points() {
    let h = TestHarness::new("concurrency-await");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_async_node("fetch_tool", |_, v| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::task::yield_now().await;
            Ok(v)
        })
        .add_async_node("summarize_llm", |_, v| async move {
            tokio::task::yield_now().await;
            Ok(json!(format!("summary of {}", v.as_str().unwrap_or_default())))
        })
        .build();

    let result = graph.ainvoke(json!("doc")).await.unwrap();
    assert_eq!(result, json!("summary of doc"));

    assert_eq!(h.recorder.len(), 3);
    assert_child_of!(h.recorder, "fetch_tool", "pipeline");
    assert_child_of!(h.recorder, "summarize_llm", "pipeline");
    assert!(propagator::current_span().is_none());
}

#[tokio::test]
async fn test_concurrent_graphs_keep_separate_trees() {
    let h = TestHarness::new("concurrency-join");
    let slow = MockGraph::builder("graph_a", &h.framework)
        .add_async_node("a_first", |_, v| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(v)
        })
        .add_async_node("a_second", |_, v| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(v)
        })
        .build();
    let fast = MockGraph::builder("graph_b", &h.framework)
        .add_async_node("b_first", |_, v| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(v)
        })
        .add_async_node("b_second", |_, v| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(v)
        })
        .build();

    let (a, b) = tokio::join!(slow.ainvoke(json!("a")), fast.ainvoke(json!("b")));
    assert_eq!(a.unwrap(), json!("a"));
    assert_eq!(b.unwrap(), json!("b"));

    assert_eq!(h.recorder.roots().len(), 2);
    assert_child_of!(h.recorder, "a_first", "graph_a");
    assert_child_of!(h.recorder, "a_second", "graph_a");
    assert_child_of!(h.recorder, "b_first", "graph_b");
    assert_child_of!(h.recorder, "b_second", "graph_b");

    let graph_a = h.recorder.span("graph_a").unwrap();
    let graph_b = h.recorder.span("graph_b").unwrap();
    assert_ne!(graph_a.trace_id, graph_b.trace_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawned_tasks_parent_to_spawning_node() {
    let h = TestHarness::new("concurrency-spawn");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_async_node("fan_out", |graph, v| async move {
            let mut handles = Vec::new();
            for i in 0..3 {
                let graph = graph.clone();
                let input = json!({"item": i, "from": v.clone()});
                handles.push(propagator::spawn(async move {
                    graph.arun_node("worker", input).await
                }));
            }
            let mut results = Vec::new();
            for handle in handles {
                let result = handle
                    .await
                    .map_err(|e| NodeError::failed("fan_out", &e.to_string()))??;
                results.push(result);
            }
            Ok::<_, NodeError>(json!(results))
        })
        .add_async_subnode("worker", |_, v| async move {
            tokio::task::yield_now().await;
            Ok(v["item"].clone())
        })
        .build();

    let result = graph.ainvoke(json!("go")).await.unwrap();
    assert_eq!(result, json!([0, 1, 2]));

    let fan_out = h.recorder.span("fan_out").unwrap();
    let workers = h.recorder.spans_named("worker");
    assert_eq!(workers.len(), 3);
    for worker in &workers {
        assert_eq!(worker.parent_id, Some(fan_out.id));
        assert_eq!(worker.trace_id, fan_out.trace_id);
        assert_eq!(worker.status, SpanStatus::Ok);
    }
    assert_child_of!(h.recorder, "fan_out", "pipeline");
}

#[tokio::test]
async fn test_blocking_work_parents_to_spawning_node() {
    let h = TestHarness::new("concurrency-blocking");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_async_node("offload", |graph, v| async move {
            propagator::spawn_blocking(move || graph.run_node("crunch", v))
                .await
                .map_err(|e| NodeError::failed("offload", &e.to_string()))?
        })
        .add_subnode("crunch", |_, v| Ok(json!(v.as_i64().unwrap_or(0) + 1)))
        .build();

    assert_eq!(graph.ainvoke(json!(41)).await.unwrap(), json!(42));
    assert_child_of!(h.recorder, "crunch", "offload");
    assert_child_of!(h.recorder, "offload", "pipeline");
}

#[test]
fn test_spawned_threads_parent_to_spawning_node() {
    let h = TestHarness::new("concurrency-thread");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("dispatch", |graph, v| {
            let graph = graph.clone();
            propagator::spawn_thread(move || graph.run_node("compute", v))
                .join()
                .map_err(|_| NodeError::failed("dispatch", "worker thread panicked"))?
        })
        .add_subnode("compute", |_, v| Ok(json!(v.as_i64().unwrap_or(0) * 10)))
        .build();

    assert_eq!(graph.invoke(json!(3)).unwrap(), json!(30));
    assert_child_of!(h.recorder, "compute", "dispatch");
    assert_child_of!(h.recorder, "dispatch", "pipeline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sessions_are_isolated_between_tasks() {
    let h = TestHarness::new("concurrency-session-tasks");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_async_node("echo", |_, v| async move {
            tokio::task::yield_now().await;
            Ok(v)
        })
        .build();

    let mut handles = Vec::new();
    for i in 0..8 {
        let graph = graph.clone();
        handles.push(propagator::spawn(async move {
            tracehook::set_session_context(format!("session-{i}"), None);
            tokio::task::yield_now().await;
            graph.ainvoke(json!(i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let spans = h.recorder.spans();
    assert_eq!(spans.len(), 16);
    for span in &spans {
        let expected = format!("session-{}", input_of(span));
        assert_eq!(session_of(span), Some(expected.as_str()));
    }
    assert!(tracehook::session_id().is_none());
}

#[test]
fn test_sessions_are_isolated_between_threads() {
    let h = TestHarness::new("concurrency-session-threads");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_node("echo", |_, v| Ok(v))
        .build();

    tracehook::set_session_context("parent-session", None);
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let graph = graph.clone();
            propagator::spawn_thread(move || {
                if i % 2 == 0 {
                    tracehook::set_session_context(format!("session-{i}"), None);
                }
                graph.invoke(json!(i))
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    for span in h.recorder.spans() {
        let i = input_of(&span).as_i64().unwrap();
        let expected = if i % 2 == 0 {
            format!("session-{i}")
        } else {
            "parent-session".to_string()
        };
        assert_eq!(session_of(&span), Some(expected.as_str()));
    }
    assert_eq!(tracehook::session_id().as_deref(), Some("parent-session"));
    tracehook::clear_session_context();
}

#[tokio::test]
async fn test_cancelled_units_are_closed_as_failed() {
    let h = TestHarness::new("concurrency-cancel");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_async_node("stall", |_, v| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(v)
        })
        .build();

    let outcome = tokio::time::timeout(Duration::from_millis(10), graph.ainvoke(json!(null))).await;
    assert!(outcome.is_err());

    let cancelled = SpanStatus::Error {
        message: "unit of work cancelled".to_string(),
    };
    assert_eq!(h.recorder.len(), 2);
    assert_eq!(h.recorder.span("stall").unwrap().status, cancelled);
    assert_eq!(h.recorder.span("pipeline").unwrap().status, cancelled);
    assert_child_of!(h.recorder, "stall", "pipeline");
}

#[tokio::test]
async fn test_suppressed_future_emits_nothing() {
    let h = TestHarness::new("concurrency-suppressed");
    let graph = MockGraph::builder("pipeline", &h.framework)
        .add_async_node("echo", |_, v| async move { Ok(v) })
        .build();

    let result = tracehook::suppress_instrumentation_async(graph.ainvoke(json!(1))).await;
    assert_eq!(result.unwrap(), json!(1));
    assert!(h.recorder.is_empty());

    graph.ainvoke(json!(2)).await.unwrap();
    assert_eq!(h.recorder.len(), 2);
}
