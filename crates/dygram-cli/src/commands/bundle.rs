//! `dygram bundle` — stub. Bundling a machine definition with its
//! imports requires the same import resolver `check-imports` needs,
//! which belongs to a DSL front-end this core doesn't own.

use std::path::Path;

pub fn run(file: &Path, dest: Option<&Path>) -> anyhow::Result<u8> {
    let _ = (file, dest);
    eprintln!("dygram bundle: not implemented in this core (no DSL import resolver)");
    Ok(1)
}
