mod error;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;
mod static_config;

#[cfg(test)]
pub mod tests;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use repos::*;
pub use static_config::StaticTenantRepo;

use crate::config::{DatabaseConfig, SamlConfig};

/// Build the tenant repository selected by `[database]`.
///
/// With SQLite, migrations run on startup (unless disabled) and tenants from
/// the config file that are missing from the database are inserted. A tenant
/// that was soft-deleted stays deleted.
pub async fn tenant_repo_from_config(config: &SamlConfig) -> DbResult<Arc<dyn TenantRepo>> {
    match &config.database {
        DatabaseConfig::None => Ok(Arc::new(StaticTenantRepo::from_configs(
            config.idp_configs(),
        )?)),
        #[cfg(feature = "database-sqlite")]
        DatabaseConfig::Sqlite(cfg) => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(cfg.max_connections)
                .connect_with(
                    sqlx::sqlite::SqliteConnectOptions::new()
                        .filename(&cfg.path)
                        .create_if_missing(cfg.create_if_missing)
                        .journal_mode(if cfg.wal_mode {
                            sqlx::sqlite::SqliteJournalMode::Wal
                        } else {
                            sqlx::sqlite::SqliteJournalMode::Delete
                        })
                        .busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms)),
                )
                .await?;

            if cfg.run_migrations {
                tracing::info!("Running database migrations");
                sqlx::migrate!("./migrations_sqlx/sqlite").run(&pool).await?;
            }

            let repo = sqlite::SqliteTenantRepo::new(pool);
            if cfg.seed_from_config {
                seed_tenants(&repo, config.idp_configs()).await?;
            }
            Ok(Arc::new(repo))
        }
    }
}

/// Insert descriptors whose key is not yet taken. Returns how many were added.
pub async fn seed_tenants(
    repo: &dyn TenantRepo,
    idps: impl IntoIterator<Item = crate::models::IdpConfig>,
) -> DbResult<usize> {
    let mut created = 0;
    for idp in idps {
        let key = idp.key.clone();
        match repo.create(idp).await {
            Ok(_) => {
                tracing::info!(idp_key = %key, "Seeded tenant from configuration");
                created += 1;
            }
            Err(DbError::Conflict(_)) => {
                tracing::debug!(idp_key = %key, "Tenant already stored, skipping seed");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}
