//! Host tool checks run before a build touches the output directory.

use crate::error::{Error, Result};

/// True if `program` resolves to an executable on `PATH` (or is a usable path).
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Fail with every missing program listed at once.
pub fn check_required_tools<S: AsRef<str>>(programs: &[S]) -> Result<()> {
    let mut missing: Vec<&str> = programs
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !command_exists(p))
        .collect();
    missing.sort_unstable();
    missing.dedup();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::disk_write(
            "host",
            format!("missing required host tools: {}", missing.join(", ")),
        ))
    }
}
