use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::{TenantRepo, prepare_idp},
    },
    models::{IdpConfig, Tenant, normalize_host},
};

const COLUMNS: &str = r#"
    id, tenant_key, entity_id, sso_url, slo_url, sso_binding, slo_binding,
    certificates, cert_fingerprint, fingerprint_algorithm, metadata_url, hosts,
    name_id_format, enabled, created_at, updated_at, deleted_at
"#;

pub struct SqliteTenantRepo {
    pool: SqlitePool,
}

impl SqliteTenantRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn tenant_from_row(row: &SqliteRow) -> DbResult<Tenant> {
        let certificates: Vec<String> =
            serde_json::from_str(&row.get::<String, _>("certificates"))?;
        let hosts: Vec<String> = serde_json::from_str(&row.get::<String, _>("hosts"))?;

        Ok(Tenant {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            idp: IdpConfig {
                key: row.get("tenant_key"),
                entity_id: row.get("entity_id"),
                sso_url: row.get("sso_url"),
                slo_url: row.get("slo_url"),
                sso_binding: parse_column(row, "sso_binding")?,
                slo_binding: parse_column(row, "slo_binding")?,
                certificates,
                cert_fingerprint: row.get("cert_fingerprint"),
                fingerprint_algorithm: parse_column(row, "fingerprint_algorithm")?,
                metadata_url: row.get("metadata_url"),
                hosts,
                name_id_format: row.get("name_id_format"),
                enabled: row.get("enabled"),
            },
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        })
    }

}

fn parse_uuid(value: &str) -> DbResult<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| DbError::Internal(format!("Invalid UUID in database: {e}")))
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> DbResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value: String = row.get(column);
    value
        .parse()
        .map_err(|e| DbError::Internal(format!("Invalid {column} in database: {e}")))
}

#[async_trait]
impl TenantRepo for SqliteTenantRepo {
    async fn create(&self, idp: IdpConfig) -> DbResult<Tenant> {
        let tenant = Tenant::new(prepare_idp(idp)?);
        let idp = &tenant.idp;

        sqlx::query(
            r#"
            INSERT INTO tenants (
                id, tenant_key, entity_id, sso_url, slo_url, sso_binding, slo_binding,
                certificates, cert_fingerprint, fingerprint_algorithm, metadata_url, hosts,
                name_id_format, enabled, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant.id.to_string())
        .bind(&idp.key)
        .bind(&idp.entity_id)
        .bind(&idp.sso_url)
        .bind(&idp.slo_url)
        .bind(idp.sso_binding.to_string())
        .bind(idp.slo_binding.to_string())
        .bind(serde_json::to_string(&idp.certificates)?)
        .bind(&idp.cert_fingerprint)
        .bind(idp.fingerprint_algorithm.to_string())
        .bind(&idp.metadata_url)
        .bind(serde_json::to_string(&idp.hosts)?)
        .bind(&idp.name_id_format)
        .bind(idp.enabled)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Conflict(
                format!("Tenant with key '{}' already exists", idp.key),
            ),
            _ => DbError::from(e),
        })?;

        Ok(tenant)
    }

    async fn find_by_key(&self, key: &str) -> DbResult<Option<Tenant>> {
        let query =
            format!("SELECT {COLUMNS} FROM tenants WHERE tenant_key = ? AND deleted_at IS NULL");
        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::tenant_from_row).transpose()
    }

    async fn find_by_host(&self, host: &str) -> DbResult<Option<Tenant>> {
        let query = format!(
            r#"
            SELECT {COLUMNS} FROM tenants
            WHERE deleted_at IS NULL
              AND EXISTS (SELECT 1 FROM json_each(tenants.hosts) WHERE json_each.value = ?)
            ORDER BY created_at ASC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&query)
            .bind(normalize_host(host))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::tenant_from_row).transpose()
    }

    async fn list(&self, include_deleted: bool) -> DbResult<Vec<Tenant>> {
        let filter = if include_deleted {
            ""
        } else {
            "WHERE deleted_at IS NULL"
        };
        let query = format!("SELECT {COLUMNS} FROM tenants {filter} ORDER BY tenant_key ASC");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::tenant_from_row).collect()
    }

    async fn delete(&self, key: &str) -> DbResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET deleted_at = ?, updated_at = ?
            WHERE tenant_key = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn restore(&self, key: &str) -> DbResult<Tenant> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET deleted_at = NULL, updated_at = ?
            WHERE tenant_key = ? AND deleted_at IS NOT NULL
            "#,
        )
        .bind(Utc::now())
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        self.find_by_key(key).await?.ok_or(DbError::NotFound)
    }
}
