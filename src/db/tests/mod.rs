//! Shared tenant repository tests
//!
//! The same test functions run against the config-backed repository and,
//! with `database-sqlite`, against an in-memory SQLite database with the real
//! migrations applied.
