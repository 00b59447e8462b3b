use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dispatch::build_dispatch_table;
use crate::events::{event_channel, WorkflowEvent};
use crate::flowchart::Flowchart;
use crate::manifest::CapabilityManifest;
use crate::prompt::{ANSWER_END, ANSWER_START};
use crate::provider::{CapabilityCall, CapabilityProvider, InferenceProvider, InferenceReply};
use crate::runtime::{DispatchContext, RunReport, UnitRegistry};

pub const DEMO_WORKFLOW_ID: &str = "trip_planner";

/// Manifest the demo discovers its capabilities from. Everything is local
/// and deterministic; no transport is involved.
const DEMO_MANIFEST: &str = r#"
version: "0.1"
providers:
  - name: Weather
    capabilities:
      - name: forecast
        description: Five day forecast for a city.
        kind: action
        input_schema:
          properties:
            city: {type: string}
            days: {anyOf: [{type: integer}, {type: "null"}]}
  - name: News
    capabilities:
      - name: headlines
        description: Current headlines for a city.
        kind: action
        input_schema:
          properties:
            city: {type: string}
      - name: city_report
        description: Background report for a city.
        kind: data_source
        uri_template: "report://{city}"
"#;

/// The generated workflow the demo runs: two concurrent calls, a join, an
/// individually awaited data source read, a model sample, and the answer.
const DEMO_SOURCE: &str = "async def trip_planner(MCP):\n    \
a = MCP.Weather.forecast(city=\"Boston\", days=3)\n    \
b = MCP.News.headlines(city=\"Boston\")\n    \
gathered = await MCP.Wait(a, b)\n    \
report = await MCP.News.city_report(city=\"Boston\")\n    \
answer = await MCP.Sample(\"Summarize the Boston trip outlook.\")\n    \
await MCP.Output(answer)\n";

#[derive(Debug, Clone)]
pub struct DemoReport {
    pub run: RunReport,
    pub events: Vec<WorkflowEvent>,
    pub artifacts: Vec<PathBuf>,
}

/// Capability provider with canned responses, keyed by capability name.
struct CannedCapabilities {
    responses: BTreeMap<String, JsonValue>,
}

impl CapabilityProvider for CannedCapabilities {
    fn invoke(&self, call: &CapabilityCall) -> Result<JsonValue> {
        self.responses
            .get(&call.capability)
            .cloned()
            .ok_or_else(|| anyhow!("no canned response for capability '{}'", call.capability))
    }
}

/// Inference provider that answers in the required delimiter format.
struct CannedInference;

impl InferenceProvider for CannedInference {
    fn respond(&self, _system: &str, question: &str) -> Result<InferenceReply> {
        Ok(InferenceReply {
            answer: format!(
                "{ANSWER_START}\n<p>Canned summary for: {question}</p>\n{ANSWER_END}"
            ),
            prompt_tokens: 42,
            completion_tokens: 17,
        })
    }
}

fn demo_remotes() -> BTreeMap<String, Arc<dyn CapabilityProvider>> {
    let weather = CannedCapabilities {
        responses: BTreeMap::from([(
            "forecast".to_string(),
            json!({"city": "Boston", "outlook": "sunny", "high_f": 74}),
        )]),
    };
    let news = CannedCapabilities {
        responses: BTreeMap::from([
            (
                "headlines".to_string(),
                json!(["Harbor ferry schedule expands", "Marathon route announced"]),
            ),
            (
                "city_report".to_string(),
                json!({"city": "Boston", "population": 650706}),
            ),
        ]),
    };

    BTreeMap::from([
        (
            "Weather".to_string(),
            Arc::new(weather) as Arc<dyn CapabilityProvider>,
        ),
        (
            "News".to_string(),
            Arc::new(news) as Arc<dyn CapabilityProvider>,
        ),
    ])
}

/// Run the built-in demo workflow end to end and write its artifacts
/// (event stream JSON plus the rendered flowchart) under `out_dir`.
pub fn run_demo(out_dir: &Path) -> Result<DemoReport> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create demo output dir '{}'", out_dir.display()))?;

    let manifest = CapabilityManifest::from_yaml(DEMO_MANIFEST).context("demo manifest")?;
    let (sink, stream) = event_channel(DEMO_WORKFLOW_ID);
    let table = build_dispatch_table(&manifest, &demo_remotes(), &sink)?;

    let ctx = DispatchContext {
        table: Arc::new(table),
        inference: Arc::new(CannedInference),
        sink,
    };

    let registry = UnitRegistry::new();
    let run = registry.execute(DEMO_WORKFLOW_ID, DEMO_SOURCE, &ctx);
    let events = stream.drain();

    let mut artifacts = Vec::new();
    artifacts.push(write_artifact(
        out_dir,
        "events.json",
        &serde_json::to_vec_pretty(&events).context("serialize demo events")?,
    )?);
    artifacts.push(write_artifact(
        out_dir,
        "flowchart.svg",
        Flowchart::from_source(DEMO_SOURCE).to_svg().as_bytes(),
    )?);

    Ok(DemoReport {
        run,
        events,
        artifacts,
    })
}

pub fn demo_source() -> &'static str {
    DEMO_SOURCE
}

fn write_artifact(out_dir: &Path, name: &str, contents: &[u8]) -> Result<PathBuf> {
    let path = out_dir.join(name);
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write demo artifact '{}'", path.display()))?;
    Ok(path)
}
