use serde_json::{json, Map, Value};

use parley_core::capability::EntityCapability;
use parley_core::context::UnifiedContext;
use parley_core::domain::entity::EntityConfig;
use parley_core::resolver::{EntityResolver, Resolution};
use parley_db::fixtures::{invoice_workflow, CREATE_CUSTOMER};
use parley_db::{
    connect_with_settings, migrations, ContextStore, DbPool, DemoLedger, SqlContextStore,
};

type ContractResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

async fn seeded() -> ContractResult<(DemoLedger, DbPool)> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|err| format!("connect failed: {err}"))?;
    migrations::run_pending(&pool).await.map_err(|err| format!("migrations failed: {err}"))?;
    let demo = DemoLedger::new(pool.clone());
    demo.seed().await.map_err(|err| format!("seed failed: {err}"))?;
    Ok((demo, pool))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn resolver_runs_against_the_sql_ledger() -> ContractResult {
    let (demo, _pool) = seeded().await?;
    let resolver = EntityResolver::new(std::sync::Arc::new(demo.registry()));
    let workflow = invoice_workflow();
    let customer = workflow
        .entity_for_field("customer")
        .ok_or_else(|| "invoice workflow should bind customer".to_string())?;
    let mut context = UnifiedContext::new("sess-1", "user-1");

    let resolution = resolver
        .resolve(customer, "customer", Some("ACME CORP"), None, &mut context)
        .await
        .map_err(|err| format!("resolve failed: {err}"))?;
    require!(resolution.entity_id().is_some(), "Acme Corp should resolve, got {resolution:?}");

    let ambiguous = resolver
        .resolve(customer, "other_customer", Some("Initech"), None, &mut context)
        .await
        .map_err(|err| format!("resolve failed: {err}"))?;
    require!(
        matches!(ambiguous, Resolution::Ambiguous(ref hits) if hits.len() == 2),
        "duplicate names should be ambiguous, got {ambiguous:?}"
    );

    let missing = resolver
        .resolve(customer, "third_customer", Some("Umbrella"), None, &mut context)
        .await
        .map_err(|err| format!("resolve failed: {err}"))?;
    require!(missing == Resolution::Missing, "unknown customer should be missing");
    require!(
        customer.sub_workflow.as_ref().map(|sub| sub.workflow_id.as_str())
            == Some(CREATE_CUSTOMER),
        "missing customers should route to the creation sub-workflow"
    );
    Ok(())
}

#[tokio::test]
async fn confirm_first_products_are_not_created_silently() -> ContractResult {
    let (demo, _pool) = seeded().await?;
    let resolver = EntityResolver::new(std::sync::Arc::new(demo.registry()));
    let items = EntityConfig::list("items", "product", "product").allow_direct_create(true);
    let mut context = UnifiedContext::new("sess-2", "user-1");

    let resolution = resolver
        .resolve(&items, "items[0]", Some("Standing Desk"), None, &mut context)
        .await
        .map_err(|err| format!("resolve failed: {err}"))?;
    require!(resolution == Resolution::Missing, "confirm-first create should report missing");

    let params = object(json!({"name": "Standing Desk"}));
    let record = resolver
        .create_missing(&items, "items[0]", &params, &mut context)
        .await
        .map_err(|err| format!("create failed: {err}"))?;
    require!(context.entity("items[0]").resolved_id() == Some(record.id));

    let products = demo.registry().require("product").map_err(|err| err.to_string())?;
    let hits = products.search("name", "standing desk").await.map_err(|err| err.to_string())?;
    require!(hits.len() == 1, "created product should be searchable");
    Ok(())
}

#[tokio::test]
async fn contexts_persist_alongside_the_ledger() -> ContractResult {
    let (_demo, pool) = seeded().await?;
    let store = SqlContextStore::new(pool);
    let mut context = UnifiedContext::new("sess-3", "user-9");
    context.begin_workflow("create_invoice", object(json!({"customer": "Acme Corp"})));

    store.save(&context).await.map_err(|err| format!("save failed: {err}"))?;
    let loaded = store
        .load("sess-3")
        .await
        .map_err(|err| format!("load failed: {err}"))?
        .ok_or_else(|| "context should be stored".to_string())?;
    require!(loaded.workflow_state.get("customer") == Some(&json!("Acme Corp")));
    Ok(())
}
