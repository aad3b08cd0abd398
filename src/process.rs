//! External process launcher (spec.md §9 "Fork/double-fork action scripts").
//!
//! The original forks twice and lets `init` inherit the orphaned child so it
//! never has to reap it. `std::process::Command` already gives an
//! un-waited-for child a background OS thread can reap without blocking the
//! caller, so this repo spawns once and hands the `Child` to a detached
//! reaper thread instead of reimplementing double-fork over `libc`.

use tracing::warn;

/// Spawns `cmd` with `args`, detached from the caller: the call returns as
/// soon as the child starts, and a background thread reaps its exit status
/// so it never lingers as a zombie.
pub fn spawn_detached(cmd: &str, args: &[String]) {
    let mut command = std::process::Command::new(cmd);
    command.args(args);
    match command.spawn() {
        Ok(mut child) => {
            let cmd = cmd.to_string();
            std::thread::spawn(move || match child.wait() {
                Ok(status) if !status.success() => {
                    warn!(%cmd, ?status, "action script exited non-zero");
                }
                Err(err) => warn!(%cmd, %err, "failed to reap action script"),
                _ => {}
            });
        }
        Err(err) => {
            warn!(%cmd, %err, "failed to spawn action script");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_missing_binary_logs_and_does_not_panic() {
        spawn_detached("/nonexistent/flowcore-test-binary", &[]);
    }

    #[test]
    fn spawn_true_reaps_without_blocking() {
        spawn_detached("true", &[]);
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}
