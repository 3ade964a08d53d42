//! `dygram check-imports` — stub. Import resolution belongs to the
//! DSL front-end, which this core doesn't own.

use std::path::Path;

pub fn run(file: &Path) -> anyhow::Result<u8> {
    let _ = file;
    eprintln!("dygram check-imports: not implemented in this core (no DSL import resolver)");
    Ok(1)
}
