//! Graceful shutdown coordination for gateway tasks

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Wait for each task to finish, bounded per task. Tasks that exceed the
/// timeout are aborted and shutdown continues for the rest; by the time
/// this runs the cancellation token has already fired, so a stuck task is
/// one that stopped listening.
pub async fn graceful_shutdown(tasks: Vec<(&'static str, JoinHandle<()>)>, task_timeout: Duration) {
    info!(
        "Beginning graceful shutdown of {} task(s) (timeout: {:?})",
        tasks.len(),
        task_timeout
    );

    let mut success_count = 0;
    let mut timeout_count = 0;

    for (name, handle) in tasks {
        match timeout(task_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Task {name} shut down cleanly");
                success_count += 1;
            }
            Ok(Err(err)) => {
                warn!("Task {name} ended abnormally: {err}");
            }
            Err(_) => {
                warn!("Task {name} shutdown timed out after {task_timeout:?}; aborting");
                timeout_count += 1;
            }
        }
    }

    info!("Graceful shutdown complete: {success_count} clean, {timeout_count} timed out");
}
