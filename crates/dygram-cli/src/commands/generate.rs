//! `dygram generate` — stub. The DSL-to-JSON compiler and diagram
//! renderers are external collaborators this core does not own;
//! wiring a real implementation here would mean fabricating that
//! compiler.

use std::path::Path;

pub fn run(file: &Path, formats: &[String], dest: Option<&Path>) -> anyhow::Result<u8> {
    let _ = (file, formats, dest);
    eprintln!("dygram generate: not implemented in this core (no DSL compiler or diagram renderer)");
    Ok(1)
}
