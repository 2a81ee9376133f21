use serde_json::{json, Value};

use parley_agent::DiscoveredCatalog;
use parley_core::config::LoadOptions;

use crate::bootstrap::{bootstrap, current_thread_runtime};
use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("catalog", &error),
    };

    let result = runtime.block_on(async {
        let app = bootstrap(LoadOptions::default()).await?;
        let agent = app.agent_runtime()?;
        let catalog = agent.catalog().await;
        app.db_pool.close().await;
        Ok::<DiscoveredCatalog, crate::bootstrap::BootstrapError>(catalog)
    });

    match result {
        Ok(catalog) => {
            let stats = catalog.stats();
            let message = format!("{} actions discovered, {} enabled", stats.total, stats.enabled);
            CommandResult::success_with_data("catalog", message, describe(&catalog))
        }
        Err(error) => CommandResult::from_bootstrap("catalog", &error),
    }
}

pub fn describe(catalog: &DiscoveredCatalog) -> Value {
    let actions: Vec<Value> = catalog
        .iter()
        .map(|definition| {
            json!({
                "id": definition.id,
                "label": definition.label,
                "executor": definition.executor.as_str(),
                "origin": definition.origin.label(),
                "entity_type": definition.entity_type,
                "enabled": definition.enabled,
                "triggers": definition.triggers,
            })
        })
        .collect();
    json!({"stats": catalog.stats(), "actions": actions})
}

#[cfg(test)]
mod tests {
    use parley_agent::DiscoveredCatalog;
    use parley_core::domain::action::{ActionDefinition, ExecutorKind};

    use super::describe;

    #[test]
    fn describe_lists_actions_with_their_executor() {
        let catalog = DiscoveredCatalog::from_actions([
            ActionDefinition::new("create_invoice", ExecutorKind::Workflow)
                .with_triggers(["create invoice"])
                .for_entity("invoice"),
            ActionDefinition::new("ping", ExecutorKind::Custom),
        ]);

        let described = describe(&catalog);
        assert_eq!(described["stats"]["total"], 2);
        assert_eq!(described["actions"][0]["id"], "create_invoice");
        assert_eq!(described["actions"][0]["executor"], "workflow");
        assert_eq!(described["actions"][1]["entity_type"], serde_json::Value::Null);
    }
}
