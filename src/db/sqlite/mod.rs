mod tenants;

pub use tenants::SqliteTenantRepo;
