//! PostgreSQL-backed implementations of the storage seams.

mod postgres;

pub use postgres::PgStore;
