//! `dygram exec list|status|rm|clean` — real commands backed directly
//! by [`dygram_session::SessionStore`].

use dygram_core::config::EngineConfig;
use dygram_session::SessionStore;

fn store() -> SessionStore {
    SessionStore::new(EngineConfig::from_env().session_root)
}

pub fn list() -> anyhow::Result<u8> {
    let sessions = store().list()?;
    if sessions.is_empty() {
        println!("no saved executions");
        return Ok(0);
    }
    for session in sessions {
        println!(
            "{:<28} {:<10} steps={:<6} paths={:<4} errors={:<3} last={}",
            session.id, format!("{:?}", session.status).to_lowercase(), session.step_count, session.path_count, session.error_count, session.last_executed_at
        );
    }
    Ok(0)
}

pub fn status(id: &str) -> anyhow::Result<u8> {
    let id = resolve_id(id)?;
    let metadata = store().status(&id)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(0)
}

pub fn rm(id: &str) -> anyhow::Result<u8> {
    let id = resolve_id(id)?;
    store().remove(&id)?;
    println!("removed {id}");
    Ok(0)
}

pub fn clean(all: bool) -> anyhow::Result<u8> {
    let removed = store().clean(all)?;
    println!("removed {removed} execution(s)");
    Ok(0)
}

fn resolve_id(id: &str) -> anyhow::Result<String> {
    if id == "last" {
        Ok(store().resolve_last()?)
    } else {
        Ok(id.to_string())
    }
}
