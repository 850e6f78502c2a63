//! Inbound reboot command handling.

use std::path::PathBuf;
use tracing::{error, info, warn};

/// Token that requests a host reboot when seen anywhere in an inbound line.
pub const REBOOT_TOKEN: &str = "rsh-reboot";

/// Case-insensitive check for the reboot token.
pub fn contains_reboot_command(line: &str) -> bool {
    line.to_lowercase().contains(REBOOT_TOKEN)
}

/// Side effect run when a reboot command is received.
///
/// Implementations must not block: the reader loop calls this inline.
pub trait RebootAction: Send + Sync {
    /// Fire the action. Failures are logged, never returned.
    fn trigger(&self);
}

/// Runs an external program, detached.
#[derive(Debug, Clone)]
pub struct CommandReboot {
    program: PathBuf,
}

impl CommandReboot {
    /// Run `program` on each reboot command.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl RebootAction for CommandReboot {
    fn trigger(&self) {
        info!(program = %self.program.display(), "Reboot command received over serial");
        match tokio::process::Command::new(&self.program).spawn() {
            // Dropping the handle detaches the child; tokio reaps it in the background.
            Ok(child) => drop(child),
            Err(e) => error!(
                program = %self.program.display(),
                error = %e,
                "Failed to launch reboot command"
            ),
        }
    }
}

/// Logs the request and prints a notice instead of rebooting.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmulatedReboot;

impl RebootAction for EmulatedReboot {
    fn trigger(&self) {
        warn!("Reboot command received via console (emulated)");
        println!("[ConsoleTransport] Emulated reboot triggered.");
    }
}
