use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::{json, Value as JsonValue};

use conductor::dispatch::build_dispatch_table;
use conductor::events::{event_channel, WorkflowEvent, WorkflowEventStream};
use conductor::manifest::CapabilityManifest;
use conductor::provider::{CapabilityCall, CapabilityProvider, InferenceProvider, InferenceReply};
use conductor::runtime::{DispatchContext, UnitRegistry};

const TEST_MANIFEST: &str = r#"
version: "0.1"
providers:
  - name: T
    capabilities:
      - name: slow
        description: Echo that takes a while.
        kind: action
      - name: fast
        description: Echo that returns immediately.
        kind: action
      - name: boom
        description: Always fails remotely.
        kind: action
"#;

struct TestCapabilities;

impl CapabilityProvider for TestCapabilities {
    fn invoke(&self, call: &CapabilityCall) -> Result<JsonValue> {
        match call.capability.as_str() {
            "slow" => {
                std::thread::sleep(Duration::from_millis(40));
                Ok(json!("slow"))
            }
            "fast" => Ok(json!("fast")),
            "boom" => Err(anyhow!("remote exploded")),
            other => Err(anyhow!("unknown capability '{other}'")),
        }
    }
}

struct TestInference {
    malformed: bool,
}

impl InferenceProvider for TestInference {
    fn respond(&self, _system: &str, question: &str) -> Result<InferenceReply> {
        let answer = if self.malformed {
            "no delimiters anywhere in this response".to_string()
        } else {
            format!("[STARTANSWER]ok: {question}[ENDANSWER]")
        };
        Ok(InferenceReply {
            answer,
            prompt_tokens: 5,
            completion_tokens: 3,
        })
    }
}

fn context(malformed_inference: bool) -> (DispatchContext, WorkflowEventStream) {
    let manifest = CapabilityManifest::from_yaml(TEST_MANIFEST).expect("test manifest");
    let (sink, stream) = event_channel("wf");
    let remotes: BTreeMap<String, Arc<dyn CapabilityProvider>> = BTreeMap::from([(
        "T".to_string(),
        Arc::new(TestCapabilities) as Arc<dyn CapabilityProvider>,
    )]);
    let table = build_dispatch_table(&manifest, &remotes, &sink).expect("dispatch table");

    (
        DispatchContext {
            table: Arc::new(table),
            inference: Arc::new(TestInference {
                malformed: malformed_inference,
            }),
            sink,
        },
        stream,
    )
}

fn update_ts(events: &[WorkflowEvent], wanted: &str) -> u128 {
    events
        .iter()
        .find_map(|ev| match ev {
            WorkflowEvent::WorkflowUpdate { message, ts_ms, .. } if message == wanted => {
                Some(*ts_ms)
            }
            _ => None,
        })
        .unwrap_or_else(|| panic!("no update event with message '{wanted}'"))
}

fn update_index(events: &[WorkflowEvent], wanted: &str) -> usize {
    events
        .iter()
        .position(|ev| {
            matches!(ev, WorkflowEvent::WorkflowUpdate { message, .. } if message == wanted)
        })
        .unwrap_or_else(|| panic!("no update event with message '{wanted}'"))
}

#[test]
fn stream_is_bracketed_by_exactly_one_start_and_end_on_success() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    \
x = await MCP.T.fast()\n    \
answer = await MCP.Sample(\"what now?\")\n    \
await MCP.Output(answer)\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.succeeded(), "{report:?}");
    assert!(!report.leaked);

    let events = stream.drain();
    assert!(matches!(
        events.first(),
        Some(WorkflowEvent::WorkflowStart { .. })
    ));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { .. })
    ));
    let starts = events
        .iter()
        .filter(|ev| matches!(ev, WorkflowEvent::WorkflowStart { .. }))
        .count();
    let ends = events
        .iter()
        .filter(|ev| matches!(ev, WorkflowEvent::WorkflowEnd { .. }))
        .count();
    assert_eq!((starts, ends), (1, 1));
}

#[test]
fn failing_capability_still_reaches_purged_and_the_stream_still_ends() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    x = await MCP.T.boom()\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.run_error.is_some());
    assert!(!registry.contains("wf"), "unit must be purged after failure");

    let events = stream.drain();
    assert!(matches!(
        events.first(),
        Some(WorkflowEvent::WorkflowStart { .. })
    ));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { .. })
    ));

    // Begin event, failure-tagged end event, then the run-failure bracket.
    let begin = update_index(&events, "Beginning T.boom()");
    let end = update_index(&events, "Returned from T.boom()");
    let failed = update_index(&events, "Workflow 'wf' failed");
    assert!(begin < end && end < failed);
}

#[test]
fn wait_brackets_the_joined_calls_begin_and_end_pairs() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    \
a = MCP.T.slow()\n    \
b = MCP.T.fast()\n    \
r = await MCP.Wait(a, b)\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.succeeded(), "{report:?}");

    let events = stream.drain();
    let wait_begin = update_ts(&events, "Beginning Wait");
    let wait_end = update_ts(&events, "Returned from Wait");

    for capability in ["slow", "fast"] {
        let begin = update_ts(&events, &format!("Beginning T.{capability}()"));
        let end = update_ts(&events, &format!("Returned from T.{capability}()"));
        assert!(begin <= end, "per-branch ordering for {capability}");
        assert!(
            wait_begin <= begin && end <= wait_end,
            "Wait bracket must contain {capability} ({wait_begin} <= {begin}, {end} <= {wait_end})"
        );
    }
}

#[test]
fn wait_returns_results_in_argument_order_not_completion_order() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    // `slow` finishes last but is the first argument.
    let source = "async def wf(MCP):\n    \
a = MCP.T.slow()\n    \
b = MCP.T.fast()\n    \
r = await MCP.Wait(a, b)\n    \
await MCP.Output(r)\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.succeeded(), "{report:?}");

    let events = stream.drain();
    let answer = events
        .iter()
        .find_map(|ev| match ev {
            WorkflowEvent::AnswerUpdate { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("answer event");
    assert_eq!(answer, "[\"slow\",\"fast\"]");
}

#[test]
fn each_branch_keeps_its_own_begin_before_end_ordering() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    \
a = MCP.T.slow()\n    \
b = MCP.T.fast()\n    \
r = await MCP.Wait(a, b)\n";
    registry.execute("wf", source, &ctx);

    let events = stream.drain();
    for capability in ["slow", "fast"] {
        let begin = update_index(&events, &format!("Beginning T.{capability}()"));
        let end = update_index(&events, &format!("Returned from T.{capability}()"));
        assert!(begin < end, "begin must precede end for {capability}");
    }
}

#[test]
fn a_failing_member_still_gets_the_wait_end_event() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    \
a = MCP.T.boom()\n    \
b = MCP.T.fast()\n    \
r = await MCP.Wait(a, b)\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.run_error.is_some());
    let error = report.run_error.unwrap_or_default();
    assert!(error.contains("T.boom()"), "{error}");
    assert!(error.contains("line 2"), "{error}");

    let events = stream.drain();
    let wait_end = update_index(&events, "Returned from Wait");
    let member_end = update_index(&events, "Returned from T.boom()");
    assert!(member_end < wait_end);
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { .. })
    ));
}

#[test]
fn sample_recovers_from_a_delimiter_violation_with_a_fallback_answer() {
    let (ctx, stream) = context(true);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    \
answer = await MCP.Sample(\"anything\")\n    \
await MCP.Output(answer)\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.succeeded(), "a format violation must not abort the run");

    let events = stream.drain();
    let answer = events
        .iter()
        .find_map(|ev| match ev {
            WorkflowEvent::AnswerUpdate { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("answer event");
    assert!(
        answer.contains("no delimiters anywhere in this response"),
        "fallback must embed the raw response: {answer}"
    );

    // Metrics hover shows up regardless of the parse outcome.
    let metrics = events.iter().find_map(|ev| match ev {
        WorkflowEvent::WorkflowUpdate { message, hover, .. }
            if message == "Received Sample answer" =>
        {
            hover.clone()
        }
        _ => None,
    });
    let metrics = metrics.expect("metrics hover");
    assert!(metrics.contains("Prompt tokens: 5"), "{metrics}");
    assert!(metrics.contains("Completion tokens: 3"), "{metrics}");
    assert!(metrics.contains("Time:"), "{metrics}");
}

#[test]
fn output_brackets_the_answer_event_at_its_own_line() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    await MCP.Output(\"final text\")\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.succeeded(), "{report:?}");

    let events = stream.drain();
    let begin = update_index(&events, "Beginning Output");
    let end = update_index(&events, "Returned from Output");
    let answer = events
        .iter()
        .position(|ev| matches!(ev, WorkflowEvent::AnswerUpdate { .. }))
        .expect("answer event");
    assert!(begin < answer && answer < end);

    match &events[answer] {
        WorkflowEvent::AnswerUpdate { line, message, .. } => {
            assert_eq!(*line, Some(2));
            assert_eq!(message, "final text");
        }
        other => panic!("expected answer, got {other:?}"),
    }
}

#[test]
fn line_numbers_in_events_match_the_source_lines() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n\n    x = await MCP.T.fast()\n";
    registry.execute("wf", source, &ctx);

    let events = stream.drain();
    let begin = events
        .iter()
        .find_map(|ev| match ev {
            WorkflowEvent::WorkflowUpdate { line, message, .. }
                if message == "Beginning T.fast()" =>
            {
                Some(*line)
            }
            _ => None,
        })
        .expect("begin update");
    assert_eq!(begin, Some(3));
}

#[test]
fn compile_failure_is_reported_without_a_running_transition() {
    let (ctx, stream) = context(false);
    let registry = UnitRegistry::new();

    let source = "async def wf(MCP):\n    x = await launch_missiles()\n";
    let report = registry.execute("wf", source, &ctx);
    assert!(report.load_error.is_some());
    assert!(report.run_error.is_none());
    assert!(!registry.contains("wf"));

    let events = stream.drain();
    assert_eq!(events.len(), 3, "start, load-failure report, end");
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { .. })
    ));
}
