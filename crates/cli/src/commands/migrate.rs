use parley_core::config::LoadOptions;

use crate::bootstrap::{bootstrap, current_thread_runtime};
use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("migrate", &error),
    };

    let result = runtime.block_on(async {
        let app = bootstrap(LoadOptions::default()).await?;
        app.db_pool.close().await;
        Ok::<(), crate::bootstrap::BootstrapError>(())
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(error) => CommandResult::from_bootstrap("migrate", &error),
    }
}
