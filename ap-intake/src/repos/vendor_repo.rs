//! Vendor Store repository.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use thiserror::Error;

#[derive(Debug, Clone, FromRow)]
pub struct VendorRow {
    pub vendor_key: String,
    pub vendor_name: String,
    pub expense_dept: Option<String>,
    pub gl_code: Option<String>,
    pub allocation_schedule: Option<String>,
    pub billing_party: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub product_category: Option<String>,
    pub venue_required: Option<bool>,
}

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("vendor key already exists: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::retry::Retriable for VendorError {
    fn is_retriable(&self) -> bool {
        matches!(self, VendorError::Database(_))
    }
}

/// Keyed read, constant-time expected against the `vendor_key` primary
/// key index.
pub async fn lookup(pool: &PgPool, vendor_key: &str) -> Result<Option<VendorRow>, VendorError> {
    let row = sqlx::query_as::<_, VendorRow>(
        r#"
        SELECT vendor_key, vendor_name, expense_dept, gl_code, allocation_schedule,
               billing_party, active, created_at, updated_at, product_category, venue_required
        FROM vendor_master
        WHERE vendor_key = $1
        "#,
    )
    .bind(vendor_key)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// All active vendor names, used as the fuzzy/LLM candidate pool.
pub async fn list_active(pool: &PgPool) -> Result<Vec<VendorRow>, VendorError> {
    let rows = sqlx::query_as::<_, VendorRow>(
        r#"
        SELECT vendor_key, vendor_name, expense_dept, gl_code, allocation_schedule,
               billing_party, active, created_at, updated_at, product_category, venue_required
        FROM vendor_master
        WHERE active = true
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Administrative create. Rejects if the normalized key already exists.
pub async fn create(
    pool: &PgPool,
    vendor_key: &str,
    vendor_name: &str,
    expense_dept: Option<&str>,
    gl_code: Option<&str>,
    allocation_schedule: Option<&str>,
    billing_party: Option<&str>,
) -> Result<(), VendorError> {
    if lookup(pool, vendor_key).await?.is_some() {
        return Err(VendorError::Conflict(vendor_key.to_string()));
    }

    sqlx::query(
        r#"
        INSERT INTO vendor_master
            (vendor_key, vendor_name, expense_dept, gl_code, allocation_schedule, billing_party, active)
        VALUES ($1, $2, $3, $4, $5, $6, true)
        "#,
    )
    .bind(vendor_key)
    .bind(vendor_name)
    .bind(expense_dept)
    .bind(gl_code)
    .bind(allocation_schedule)
    .bind(billing_party)
    .execute(pool)
    .await?;

    Ok(())
}

/// Deactivation is preferred over deletion.
pub async fn deactivate(pool: &PgPool, vendor_key: &str) -> Result<(), VendorError> {
    sqlx::query("UPDATE vendor_master SET active = false, updated_at = NOW() WHERE vendor_key = $1")
        .bind(vendor_key)
        .execute(pool)
        .await?;
    Ok(())
}
