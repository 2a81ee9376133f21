//! Demo ledger wiring: customers, products and invoices exposed through the
//! entity capability surface, plus the guided workflows that create them.
//!
//! The CLI chat command and the end-to-end scenario tests both run against
//! this ledger.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use parley_core::capability::{CapabilityError, EntityCapability, EntityRegistry};
use parley_core::domain::action::FieldSpec;
use parley_core::domain::entity::{EntityConfig, EntityRecord, SubWorkflowRef};
use parley_core::flows::WorkflowConfig;

use crate::repositories::{
    ledger::{LedgerCustomer, LedgerProduct},
    InvoiceLine, RepositoryError, SqlLedgerRepository,
};
use crate::DbPool;

pub const CREATE_INVOICE: &str = "create_invoice";
pub const CREATE_CUSTOMER: &str = "create_customer";

const SEED_CUSTOMERS: &[(&str, Option<&str>, Option<&str>)] = &[
    ("Acme Corp", Some("billing@acme.test"), Some("+1 555 0100")),
    ("Globex Industries", Some("ap@globex.test"), None),
    ("Initech", Some("finance@initech.test"), Some("+1 555 0142")),
    ("Initech", Some("payables@initech-east.test"), Some("+1 555 0199")),
];

const SEED_PRODUCTS: &[(&str, Option<i64>)] =
    &[("Laptop", None), ("Mouse", Some(2500)), ("Desk", Some(15000)), ("Monitor", Some(21900))];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub customers: usize,
    pub products: usize,
}

/// Entry point for the demo ledger.
#[derive(Clone)]
pub struct DemoLedger {
    ledger: SqlLedgerRepository,
}

impl DemoLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { ledger: SqlLedgerRepository::new(pool) }
    }

    pub fn repository(&self) -> &SqlLedgerRepository {
        &self.ledger
    }

    /// Inserts the sample rows. Running it twice inserts them twice.
    pub async fn seed(&self) -> Result<SeedSummary, RepositoryError> {
        for (name, email, phone) in SEED_CUSTOMERS {
            self.ledger.insert_customer(name, *email, *phone, "seed").await?;
        }
        for (name, cents) in SEED_PRODUCTS {
            let price = cents.map(|cents| Decimal::new(cents, 2));
            self.ledger.insert_product(name, price, "seed").await?;
        }

        let summary =
            SeedSummary { customers: SEED_CUSTOMERS.len(), products: SEED_PRODUCTS.len() };
        info!(
            event_name = "fixtures.demo_ledger_seeded",
            customers = summary.customers,
            products = summary.products,
            "demo ledger seeded"
        );
        Ok(summary)
    }

    pub fn registry(&self) -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register(CustomerCapability { ledger: self.ledger.clone() });
        registry.register(ProductCapability { ledger: self.ledger.clone() });
        registry.register(InvoiceCapability { ledger: self.ledger.clone() });
        registry
    }

    pub fn workflows(&self) -> Vec<WorkflowConfig> {
        vec![invoice_workflow(), customer_workflow()]
    }
}

pub fn invoice_workflow() -> WorkflowConfig {
    WorkflowConfig::new(CREATE_INVOICE, "create an invoice")
        .with_field("customer", FieldSpec::entity("customer", "Customer being invoiced").required())
        .with_field("items", FieldSpec::array("Invoice line items", line_item_schema()).required())
        .with_field(
            "due_date",
            FieldSpec::string("Payment due date").with_example(json!("2026-12-01")),
        )
        .with_entity(
            EntityConfig::single("customer", "customer")
                .search_by(["name", "email"])
                .with_sub_workflow(SubWorkflowRef::new(CREATE_CUSTOMER).identifier_as("name"))
                .with_prompt("Which customer is this invoice for?"),
        )
        .with_entity(
            EntityConfig::list("items", "product", "product")
                .require_item_fields(["unit_price"])
                .allow_direct_create(true),
        )
        .with_prompt("items", "Which products should go on the invoice, and how many of each?")
        .with_prompt("items[].unit_price", "What is the price for the {item}?")
        .confirm_before_complete(true)
}

pub fn customer_workflow() -> WorkflowConfig {
    WorkflowConfig::new(CREATE_CUSTOMER, "add a customer")
        .with_field("name", FieldSpec::string("Customer name").required())
        .with_field("phone", FieldSpec::string("Contact phone number").required())
        .with_field("email", FieldSpec::string("Billing email address"))
        .with_prompt("phone", "What phone number should we keep on file for this customer?")
}

fn line_item_schema() -> BTreeMap<String, FieldSpec> {
    BTreeMap::from([
        ("product".to_string(), FieldSpec::string("Product name").required()),
        ("quantity".to_string(), FieldSpec::integer("Number of units").required()),
        ("unit_price".to_string(), FieldSpec::number("Price per unit")),
    ])
}

fn map_repository_error(error: RepositoryError) -> CapabilityError {
    match error {
        RepositoryError::Constraint(message) => CapabilityError::Validation(message),
        other => CapabilityError::Backend(other.to_string()),
    }
}

fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, CapabilityError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| CapabilityError::Validation(format!("`{key}` is required")))
}

fn optional_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).map(str::trim).filter(|value| !value.is_empty())
}

fn integer_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub fn decimal_value(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(text) => {
            Decimal::from_str(text.trim().trim_start_matches('$').replace(',', "").as_str()).ok()
        }
        _ => None,
    }
}

fn customer_record(customer: LedgerCustomer) -> EntityRecord {
    let mut record = EntityRecord::new(customer.id, "customer", customer.name.clone())
        .with_field("name", json!(customer.name));
    if let Some(email) = customer.email {
        record = record.with_field("email", json!(email));
    }
    if let Some(phone) = customer.phone {
        record = record.with_field("phone", json!(phone));
    }
    record
}

fn product_record(product: LedgerProduct) -> EntityRecord {
    let mut record = EntityRecord::new(product.id, "product", product.name.clone())
        .with_field("name", json!(product.name));
    if let Some(price) = product.unit_price {
        record = record.with_field("unit_price", json!(price.to_string()));
    }
    record
}

pub struct CustomerCapability {
    ledger: SqlLedgerRepository,
}

#[async_trait]
impl EntityCapability for CustomerCapability {
    fn entity_type(&self) -> &str {
        "customer"
    }

    fn field_schema(&self) -> BTreeMap<String, FieldSpec> {
        customer_workflow().fields
    }

    fn bound_workflow(&self) -> Option<String> {
        Some(CREATE_CUSTOMER.to_string())
    }

    async fn create(
        &self,
        params: &Map<String, Value>,
        user_id: &str,
    ) -> Result<EntityRecord, CapabilityError> {
        let name = required_str(params, "name")?;
        let email = optional_str(params, "email");
        let phone = optional_str(params, "phone");
        let customer = self
            .ledger
            .insert_customer(name, email, phone, user_id)
            .await
            .map_err(map_repository_error)?;
        Ok(customer_record(customer))
    }

    async fn search(&self, field: &str, value: &str) -> Result<Vec<EntityRecord>, CapabilityError> {
        let customers =
            self.ledger.find_customers(field, value).await.map_err(map_repository_error)?;
        Ok(customers.into_iter().map(customer_record).collect())
    }
}

pub struct ProductCapability {
    ledger: SqlLedgerRepository,
}

#[async_trait]
impl EntityCapability for ProductCapability {
    fn entity_type(&self) -> &str {
        "product"
    }

    fn field_schema(&self) -> BTreeMap<String, FieldSpec> {
        BTreeMap::from([
            ("name".to_string(), FieldSpec::string("Product name").required()),
            ("unit_price".to_string(), FieldSpec::number("List price per unit")),
        ])
    }

    async fn create(
        &self,
        params: &Map<String, Value>,
        user_id: &str,
    ) -> Result<EntityRecord, CapabilityError> {
        let name = required_str(params, "name")?;
        let price = decimal_value(params.get("unit_price"));
        let product =
            self.ledger.insert_product(name, price, user_id).await.map_err(map_repository_error)?;
        Ok(product_record(product))
    }

    async fn search(&self, field: &str, value: &str) -> Result<Vec<EntityRecord>, CapabilityError> {
        let products =
            self.ledger.find_products(field, value).await.map_err(map_repository_error)?;
        Ok(products.into_iter().map(product_record).collect())
    }
}

pub struct InvoiceCapability {
    ledger: SqlLedgerRepository,
}

#[async_trait]
impl EntityCapability for InvoiceCapability {
    fn entity_type(&self) -> &str {
        "invoice"
    }

    fn field_schema(&self) -> BTreeMap<String, FieldSpec> {
        invoice_workflow().fields
    }

    fn strict_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "customer": { "type": "string", "description": "Customer name" },
                "due_date": { "type": "string", "description": "Payment due date" },
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "product": { "type": "string" },
                            "quantity": { "type": "integer" },
                            "unit_price": { "type": "number" }
                        },
                        "required": ["product", "quantity"]
                    }
                }
            },
            "required": ["customer", "items"]
        }))
    }

    fn critical_fields(&self) -> Vec<String> {
        vec!["customer".to_string(), "items".to_string()]
    }

    fn bound_workflow(&self) -> Option<String> {
        Some(CREATE_INVOICE.to_string())
    }

    async fn create(
        &self,
        params: &Map<String, Value>,
        user_id: &str,
    ) -> Result<EntityRecord, CapabilityError> {
        let customer_id = integer_value(params.get("customer_id"))
            .ok_or_else(|| CapabilityError::Validation("`customer_id` is required".to_string()))?;
        let items = params
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| CapabilityError::Validation("`items` must be a list".to_string()))?;

        let mut lines = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let position = index + 1;
            let product_id = integer_value(item.get("product_id")).ok_or_else(|| {
                CapabilityError::Validation(format!("item {position} has no resolved product"))
            })?;
            let quantity = integer_value(item.get("quantity")).ok_or_else(|| {
                CapabilityError::Validation(format!("item {position} has no quantity"))
            })?;
            let unit_price = decimal_value(item.get("unit_price")).ok_or_else(|| {
                CapabilityError::Validation(format!("item {position} has no unit price"))
            })?;
            lines.push(InvoiceLine { product_id, quantity, unit_price });
        }

        let invoice = self
            .ledger
            .create_invoice(customer_id, optional_str(params, "due_date"), &lines, user_id)
            .await
            .map_err(map_repository_error)?;

        Ok(EntityRecord::new(invoice.id, "invoice", format!("Invoice #{}", invoice.id))
            .with_field("customer_id", json!(invoice.customer_id))
            .with_field("total", json!(invoice.total.to_string()))
            .with_field("line_count", json!(invoice.lines.len())))
    }

    async fn search(&self, field: &str, value: &str) -> Result<Vec<EntityRecord>, CapabilityError> {
        if field != "id" {
            return Ok(Vec::new());
        }
        let Ok(id) = value.trim().trim_start_matches('#').parse::<i64>() else {
            return Ok(Vec::new());
        };
        let invoice = self.ledger.find_invoice(id).await.map_err(map_repository_error)?;
        Ok(invoice
            .into_iter()
            .map(|invoice| {
                EntityRecord::new(invoice.id, "invoice", format!("Invoice #{}", invoice.id))
                    .with_field("id", json!(invoice.id))
                    .with_field("total", json!(invoice.total.to_string()))
            })
            .collect())
    }
}
