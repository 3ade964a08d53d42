//! `dygram execute` — drives a machine definition with the runtime's
//! pure `step` and async `Executor`, saving to (and optionally
//! resuming from) a [`dygram_session::SessionStore`].
//!
//! The LLM transport itself is an external collaborator: the
//! only shipped [`LlmClient`](dygram_core::llm::LlmClient) is
//! [`StubLlmClient`](dygram_core::llm::StubLlmClient), so `--playback`/
//! `--record` are accepted but not wired to a real recorded-response
//! reader/writer — a live transport is an external collaborator.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context};

use dygram_core::config::EngineConfig;
use dygram_core::executor::Executor;
use dygram_core::llm::StubLlmClient;
use dygram_core::model::MachineJson;
use dygram_core::state::create_initial_state;
use dygram_session::{ExecutionMode, SessionError, SessionStore};

pub struct ExecuteArgs {
    pub file: Option<PathBuf>,
    pub interactive: bool,
    pub id: Option<String>,
    pub force: bool,
    pub playback: Option<PathBuf>,
    pub record: Option<PathBuf>,
    pub model: Option<String>,
    pub step: bool,
    pub step_turn: bool,
    pub step_path: bool,
}

pub async fn run(args: ExecuteArgs) -> anyhow::Result<u8> {
    if args.playback.is_some() || args.record.is_some() {
        eprintln!("note: --playback/--record are accepted but no live LLM transport is wired in this core; using the deterministic stub client");
    }

    let mut config = EngineConfig::from_env();
    if let Some(model) = &args.model {
        config.model_id = Some(model.clone());
    }
    let store = SessionStore::new(config.session_root.clone());

    let (machine_source, machine) = load_machine(args.file.as_deref())?;

    let mode = if args.interactive {
        ExecutionMode::Interactive
    } else if args.playback.is_some() {
        ExecutionMode::Playback
    } else {
        ExecutionMode::Auto
    };

    let (id, mut metadata, state) = match &args.id {
        Some(raw_id) => {
            let id = if raw_id == "last" { store.resolve_last()? } else { raw_id.clone() };
            match store.resume(&id, Some(&machine), args.force) {
                Ok((metadata, state)) => (id, metadata, state),
                Err(SessionError::HashMismatch { id }) => {
                    eprintln!("error: machine definition changed since execution '{id}' was saved; pass --force to resume anyway");
                    return Ok(2);
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => {
            let (id, metadata) = store.create(machine_source, mode)?;
            let state = create_initial_state(machine, config.limits.clone()).context("building initial execution state")?;
            (id, metadata, state)
        }
    };

    let mut executor = Executor::new(StubLlmClient, config);

    let final_state = if args.step || args.step_turn || args.step_path {
        if args.step_path {
            eprintln!(
                "note: --step-path reports progress for path {} but, like every superstep, advances every active path underneath (see DESIGN.md)",
                metadata.next_path_id
            );
        }
        executor.step_once(state).await?
    } else {
        executor.run_to_completion(state).await?
    };

    store.save(&id, &final_state, &mut metadata)?;

    let status = overall_status_label(&final_state);
    println!("{id}: {status} (step_count={}, paths={})", final_state.metadata.step_count, final_state.paths.len());

    Ok(match status {
        "failed" => 1,
        _ => 0,
    })
}

fn overall_status_label(state: &dygram_core::model::ExecutionState) -> &'static str {
    use dygram_core::model::PathStatus;
    if state.paths.iter().any(|p| p.status == PathStatus::Active) {
        "running"
    } else if state.paths.iter().any(|p| p.status == PathStatus::Waiting) || state.turn_state.is_some() {
        "waiting"
    } else if state.paths.iter().any(|p| p.status == PathStatus::Failed) {
        "failed"
    } else {
        "completed"
    }
}

fn load_machine(file: Option<&std::path::Path>) -> anyhow::Result<(String, MachineJson)> {
    let (source, raw) = match file {
        Some(path) => (
            path.to_string_lossy().into_owned(),
            std::fs::read_to_string(path).with_context(|| format!("reading machine file '{}'", path.display()))?,
        ),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading machine definition from stdin")?;
            ("stdin".to_string(), buf)
        }
    };
    if raw.trim().is_empty() {
        bail!("empty machine definition ({source})");
    }
    let machine: MachineJson = serde_json::from_str(&raw).with_context(|| format!("parsing machine definition ({source})"))?;
    Ok((source, machine))
}
