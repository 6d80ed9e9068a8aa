//! Deployment collaborators: the git working copy and docker compose

pub mod compose;
pub mod git;

use std::path::Path;

use tokio::process::Command;

/// Command for a collaborator process running in `dir`.
///
/// The child is killed when the future awaiting it is dropped, so an
/// abandoned run never leaves a pull or build running without the lock.
pub(crate) fn command(program: &str, dir: &Path) -> Command {
    let mut command = Command::new(program);
    command.current_dir(dir).kill_on_drop(true);
    command
}
