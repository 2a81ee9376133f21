use parley_core::config::LoadOptions;
use parley_db::SeedSummary;

use crate::bootstrap::{bootstrap, current_thread_runtime};
use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("seed", &error),
    };

    let result = runtime.block_on(async {
        let app = match bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return Err(CommandResult::from_bootstrap("seed", &error)),
        };
        let seeded = app.ledger.seed().await.map_err(|error| {
            CommandResult::failure("seed", "seed_execution", error.to_string(), 6)
        });
        app.db_pool.close().await;
        seeded
    });

    match result {
        Ok(summary) => CommandResult::success("seed", seed_message(&summary)),
        Err(failure) => failure,
    }
}

fn seed_message(summary: &SeedSummary) -> String {
    format!(
        "demo ledger seeded with {} customers and {} products",
        summary.customers, summary.products
    )
}
