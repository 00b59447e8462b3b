use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use conductor::demo;
use conductor::dispatch::build_dispatch_table;
use conductor::events::event_channel;
use conductor::flowchart::Flowchart;
use conductor::manifest::CapabilityManifest;
use conductor::program::WorkflowProgram;
use conductor::provider::{
    build_inference_provider, CapabilityProvider, InferenceProvider, NullCapabilityProvider,
    UnconfiguredInference,
};
use conductor::runtime::{DispatchContext, UnitRegistry};

/// Conductor: runtime and tooling for generated capability workflows.
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Capability workflow runtime", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the capability descriptors and docs a manifest provides
    Inspect {
        /// Path to the capability manifest YAML
        manifest: PathBuf,
    },

    /// Render a workflow source file as an SVG flow diagram
    Render {
        /// Path to the generated workflow source
        source: PathBuf,

        /// Write the SVG here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run a generated workflow against a manifest
    ///
    /// Capability calls are acknowledged locally (the remote transport is
    /// not part of this tool); Sample goes to the manifest's inference
    /// endpoint when one is configured.
    Run {
        /// Path to the capability manifest YAML
        manifest: PathBuf,

        /// Path to the generated workflow source
        source: PathBuf,

        /// Unit id; defaults to the source's entry point name
        #[arg(long)]
        workflow_id: Option<String>,
    },

    /// Run the built-in demo workflow with canned providers
    Demo {
        /// Directory for the demo artifacts
        #[arg(long, default_value = "demo-out")]
        out_dir: PathBuf,
    },
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    if let Err(err) = real_main() {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        Command::Inspect { manifest } => {
            let manifest = CapabilityManifest::load_from_file(&manifest)?;
            let providers = manifest.descriptors()?;

            for (provider, capabilities) in &providers {
                println!("Provider: {provider} ({} capabilities)", capabilities.len());
            }
            println!();
            print!("{}", conductor::capability::render_docs(&providers));
            Ok(())
        }

        Command::Render { source, out } => {
            let text = fs::read_to_string(&source)
                .with_context(|| format!("failed to read source '{}'", source.display()))?;
            let svg = Flowchart::from_source(&text).to_svg();

            match out {
                Some(path) => {
                    fs::write(&path, svg)
                        .with_context(|| format!("failed to write '{}'", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => println!("{svg}"),
            }
            Ok(())
        }

        Command::Run {
            manifest,
            source,
            workflow_id,
        } => {
            let manifest = CapabilityManifest::load_from_file(&manifest)?;
            let text = fs::read_to_string(&source)
                .with_context(|| format!("failed to read source '{}'", source.display()))?;

            // Prefer the entry point's own name; fall back to the file stem
            // so a compile failure is still reported through the stream.
            let id = workflow_id
                .or_else(|| WorkflowProgram::parse(&text).ok().map(|p| p.name))
                .or_else(|| {
                    source
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                })
                .context("cannot determine a workflow id")?;

            let remotes: BTreeMap<String, Arc<dyn CapabilityProvider>> = manifest
                .providers
                .iter()
                .map(|p| {
                    (
                        p.name.clone(),
                        Arc::new(NullCapabilityProvider) as Arc<dyn CapabilityProvider>,
                    )
                })
                .collect();

            let inference: Arc<dyn InferenceProvider> = match &manifest.inference {
                Some(spec) => Arc::from(build_inference_provider(spec)?),
                None => Arc::new(UnconfiguredInference),
            };

            let (sink, stream) = event_channel(id.clone());
            let table = build_dispatch_table(&manifest, &remotes, &sink)?;
            let ctx = DispatchContext {
                table: Arc::new(table),
                inference,
                sink,
            };

            let registry = UnitRegistry::new();
            let report = registry.execute(&id, &text, &ctx);

            for event in stream.drain() {
                println!("{}", serde_json::to_string(&event)?);
            }
            if let Some(err) = report
                .load_error
                .as_deref()
                .or(report.run_error.as_deref())
            {
                println!("RUN FAILED: {err}");
            } else {
                println!("RUN OK");
            }
            Ok(())
        }

        Command::Demo { out_dir } => {
            let report = demo::run_demo(&out_dir)?;

            for event in &report.events {
                println!("{}", serde_json::to_string(event)?);
            }
            for artifact in &report.artifacts {
                println!("ARTIFACT {}", artifact.display());
            }
            if let Some(err) = report
                .run
                .load_error
                .as_deref()
                .or(report.run.run_error.as_deref())
            {
                println!("DEMO FAILED: {err}");
            } else {
                println!("DEMO OK");
            }
            Ok(())
        }
    }
}
