mod tenants;

pub use tenants::*;
