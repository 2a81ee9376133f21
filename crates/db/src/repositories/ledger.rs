use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::RepositoryError;
use crate::DbPool;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCustomer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerProduct {
    pub id: i64,
    pub name: String,
    pub unit_price: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price: Decimal,
}

impl InvoiceLine {
    pub fn amount(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInvoice {
    pub id: i64,
    pub customer_id: i64,
    pub due_date: Option<String>,
    pub total: Decimal,
    pub lines: Vec<InvoiceLine>,
}

/// Columns a caller may search by. Anything else is rejected before it can
/// reach the SQL text.
const CUSTOMER_SEARCH_COLUMNS: &[&str] = &["name", "email", "phone"];
const PRODUCT_SEARCH_COLUMNS: &[&str] = &["name"];

/// Small customers/products/invoices ledger used by the demo capabilities.
#[derive(Clone)]
pub struct SqlLedgerRepository {
    pool: DbPool,
}

impl SqlLedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert_customer(
        &self,
        name: &str,
        email: Option<&str>,
        phone: Option<&str>,
        created_by: &str,
    ) -> Result<LedgerCustomer, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO ledger_customer (name, email, phone, created_by, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(email)
        .bind(phone)
        .bind(created_by)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(LedgerCustomer {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
        })
    }

    pub async fn find_customers(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Vec<LedgerCustomer>, RepositoryError> {
        let column = checked_column(column, CUSTOMER_SEARCH_COLUMNS)?;
        let sql = format!(
            "SELECT id, name, email, phone FROM ledger_customer
             WHERE {column} = ? COLLATE NOCASE ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(value.trim()).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_customer).collect()
    }

    pub async fn find_customer(&self, id: i64) -> Result<Option<LedgerCustomer>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, email, phone FROM ledger_customer WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_customer).transpose()
    }

    pub async fn insert_product(
        &self,
        name: &str,
        unit_price: Option<Decimal>,
        created_by: &str,
    ) -> Result<LedgerProduct, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO ledger_product (name, unit_price, created_by, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(unit_price.map(|price| price.to_string()))
        .bind(created_by)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(LedgerProduct { id: result.last_insert_rowid(), name: name.to_string(), unit_price })
    }

    pub async fn find_products(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Vec<LedgerProduct>, RepositoryError> {
        let column = checked_column(column, PRODUCT_SEARCH_COLUMNS)?;
        let sql = format!(
            "SELECT id, name, unit_price FROM ledger_product
             WHERE {column} = ? COLLATE NOCASE ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(value.trim()).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_product).collect()
    }

    /// Writes the invoice header and its lines in one transaction.
    pub async fn create_invoice(
        &self,
        customer_id: i64,
        due_date: Option<&str>,
        lines: &[InvoiceLine],
        created_by: &str,
    ) -> Result<StoredInvoice, RepositoryError> {
        if lines.is_empty() {
            return Err(RepositoryError::Constraint("an invoice needs at least one line".into()));
        }
        if let Some(line) = lines.iter().find(|line| line.quantity <= 0) {
            return Err(RepositoryError::Constraint(format!(
                "quantity for product {} must be positive",
                line.product_id
            )));
        }
        if self.find_customer(customer_id).await?.is_none() {
            return Err(RepositoryError::Constraint(format!(
                "customer {customer_id} does not exist"
            )));
        }

        let total: Decimal = lines.iter().map(InvoiceLine::amount).sum();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO ledger_invoice (customer_id, due_date, total, created_by, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(customer_id)
        .bind(due_date)
        .bind(total.to_string())
        .bind(created_by)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let invoice_id = result.last_insert_rowid();

        for line in lines {
            sqlx::query(
                "INSERT INTO ledger_invoice_line (invoice_id, product_id, quantity, unit_price)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(invoice_id)
            .bind(line.product_id)
            .bind(line.quantity)
            .bind(line.unit_price.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(StoredInvoice {
            id: invoice_id,
            customer_id,
            due_date: due_date.map(str::to_string),
            total,
            lines: lines.to_vec(),
        })
    }

    pub async fn find_invoice(&self, id: i64) -> Result<Option<StoredInvoice>, RepositoryError> {
        let Some(header) =
            sqlx::query("SELECT id, customer_id, due_date, total FROM ledger_invoice WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let line_rows = sqlx::query(
            "SELECT product_id, quantity, unit_price FROM ledger_invoice_line
             WHERE invoice_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut lines = Vec::with_capacity(line_rows.len());
        for row in &line_rows {
            let price: String = decode(row, "unit_price")?;
            lines.push(InvoiceLine {
                product_id: decode(row, "product_id")?,
                quantity: decode(row, "quantity")?,
                unit_price: parse_decimal(&price)?,
            });
        }

        let total: String = decode(&header, "total")?;
        Ok(Some(StoredInvoice {
            id: decode(&header, "id")?,
            customer_id: decode(&header, "customer_id")?,
            due_date: decode(&header, "due_date")?,
            total: parse_decimal(&total)?,
            lines,
        }))
    }
}

fn checked_column<'a>(column: &'a str, allowed: &[&str]) -> Result<&'a str, RepositoryError> {
    if allowed.contains(&column) {
        Ok(column)
    } else {
        Err(RepositoryError::Constraint(format!("`{column}` is not a searchable column")))
    }
}

fn decode<'r, T>(row: &'r sqlx::sqlite::SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_decimal(raw: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(raw).map_err(|e| RepositoryError::Decode(format!("`{raw}`: {e}")))
}

fn row_to_customer(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerCustomer, RepositoryError> {
    Ok(LedgerCustomer {
        id: decode(row, "id")?,
        name: decode(row, "name")?,
        email: decode(row, "email")?,
        phone: decode(row, "phone")?,
    })
}

fn row_to_product(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerProduct, RepositoryError> {
    let price: Option<String> = decode(row, "unit_price")?;
    Ok(LedgerProduct {
        id: decode(row, "id")?,
        name: decode(row, "name")?,
        unit_price: price.as_deref().map(parse_decimal).transpose()?,
    })
}
