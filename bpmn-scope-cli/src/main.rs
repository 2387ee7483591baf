//! Script runner for the BPMN scope engine.
//!
//! Deploys process models, then feeds a YAML script of commands through an
//! in-memory engine and prints every committed record as one JSON line.
//!
//! Usage:
//!   bpmn-scope --definitions demos/order.yaml --script demos/modify.yaml
//!
//! Script steps are commands as accepted by the engine. A step may name its
//! result with `as:`, and later steps refer to it as `${name}` (the returned
//! key) or `${name.ELEMENT}` (the key of the active instance of ELEMENT in
//! that process instance). `tick: <ms>` advances the clock and triggers due
//! timers.
//!
//! ```yaml
//! - as: order
//!   command: create
//!   bpmn_process_id: order
//! - command: complete_element
//!   element_instance_key: ${order.review}
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bpmn_scope_core::{
    BroadcastSink, Command, CommandResponse, Engine, EngineConfig, Key, PartitionState, PermissionTable,
    ProcessModel, Record, RequestMetadata,
};
use clap::Parser;
use serde_yaml::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "bpmn-scope")]
#[command(about = "Run a command script against the BPMN scope engine")]
struct Args {
    /// Engine configuration (YAML). Defaults apply when omitted.
    #[arg(long, short = 'c', env = "BPMN_SCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Process model files (YAML), deployed in order.
    #[arg(long, short = 'd', required = true, num_args = 1..)]
    definitions: Vec<PathBuf>,

    /// Command script (YAML list of steps).
    #[arg(long, short = 's')]
    script: PathBuf,

    /// Permission grants (YAML). Everything is allowed when omitted.
    #[arg(long)]
    permissions: Option<PathBuf>,

    /// User the commands are issued as.
    #[arg(long, short = 'u')]
    user: Option<String>,

    /// Start of the script clock, epoch milliseconds.
    #[arg(long, default_value_t = 0)]
    start_time: i64,

    /// Print only the final outcome of each step instead of every record.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,bpmn_scope_core=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    let sink = Arc::new(BroadcastSink::new(config.event_sink_capacity));
    let printer = (!args.quiet).then(|| tokio::spawn(print_records(sink.subscribe())));
    let mut engine = Engine::new(config).with_sink(sink);
    if let Some(path) = &args.permissions {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Reading permissions {}", path.display()))?;
        engine = engine.with_authorization(Arc::new(PermissionTable::from_yaml_str(&yaml)?));
    }

    for path in &args.definitions {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Reading process model {}", path.display()))?;
        let model = ProcessModel::from_yaml_str(&yaml)
            .with_context(|| format!("Parsing process model {}", path.display()))?;
        let definition = engine.deploy(model).await?;
        eprintln!(
            "deployed {} version {} as {}",
            definition.bpmn_process_id, definition.version, definition.key
        );
    }

    let script = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Reading script {}", args.script.display()))?;
    let steps: Vec<Value> = serde_yaml::from_str(&script).context("Parsing script")?;

    let metadata = match &args.user {
        Some(user) => RequestMetadata::user(user.clone()),
        None => RequestMetadata::default(),
    };
    let mut names: BTreeMap<String, Key> = BTreeMap::new();
    let mut now = args.start_time;

    for (index, step) in steps.into_iter().enumerate() {
        let Value::Mapping(mut step) = step else {
            bail!("step {index}: expected a mapping");
        };

        if let Some(tick) = step.remove("tick") {
            let advance = tick
                .as_i64()
                .ok_or_else(|| anyhow!("step {index}: tick must be a number of milliseconds"))?;
            now += advance;
            for response in engine.trigger_due_timers(now).await? {
                print_response(index, &response);
            }
            continue;
        }

        let name = step
            .remove("as")
            .and_then(|v| v.as_str().map(str::to_string));
        let state = engine.snapshot().await;
        let resolved = substitute(Value::Mapping(step), &names, &state)
            .with_context(|| format!("step {index}"))?;
        let command: Command = serde_yaml::from_value(resolved)
            .with_context(|| format!("step {index}: not a valid command"))?;

        let response = engine.process_at(command, &metadata, now).await?;
        if let (Some(name), Some(key)) = (name, response.key()) {
            names.insert(name, key);
        }
        print_response(index, &response);
    }

    // closes the sink, which ends the printer once it has drained
    drop(engine);
    if let Some(printer) = printer {
        printer.await.context("Record printer panicked")?;
    }
    Ok(())
}

/// Committed records as JSON lines, in commit order.
async fn print_records(mut receiver: broadcast::Receiver<Record>) {
    loop {
        match receiver.recv().await {
            Ok(record) => match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, position = record.position, "unprintable record"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "record printer fell behind, raise event_sink_capacity")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_response(step: usize, response: &CommandResponse) {
    match response {
        CommandResponse::Accepted { key, records } => {
            eprintln!("step {step}: accepted, key {key}, {} records", records.len())
        }
        CommandResponse::Rejected { rejection, .. } => eprintln!(
            "step {step}: rejected {}: {}",
            rejection.rejection_type, rejection.reason
        ),
    }
}

/// Replace `${name}` and `${name.ELEMENT}` strings with keys.
fn substitute(value: Value, names: &BTreeMap<String, Key>, state: &PartitionState) -> Result<Value> {
    Ok(match value {
        Value::String(text) => match text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
            Some(reference) => Value::from(resolve(reference, names, state)?),
            None => Value::String(text),
        },
        Value::Sequence(items) => Value::Sequence(
            items
                .into_iter()
                .map(|item| substitute(item, names, state))
                .collect::<Result<_>>()?,
        ),
        Value::Mapping(map) => {
            let mut resolved = serde_yaml::Mapping::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key, substitute(value, names, state)?);
            }
            Value::Mapping(resolved)
        }
        other => other,
    })
}

fn resolve(reference: &str, names: &BTreeMap<String, Key>, state: &PartitionState) -> Result<Key> {
    let (name, element_id) = match reference.split_once('.') {
        Some((name, element_id)) => (name, Some(element_id)),
        None => (reference, None),
    };
    let key = *names
        .get(name)
        .ok_or_else(|| anyhow!("unknown reference '{name}'"))?;
    let Some(element_id) = element_id else {
        return Ok(key);
    };
    state
        .tree
        .active_instances_of(key, element_id)
        .first()
        .map(|instance| instance.key)
        .ok_or_else(|| anyhow!("no active instance of '{element_id}' in '{name}' ({key})"))
}
