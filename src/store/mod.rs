//! Persistence layer: libSQL-backed storage for intake links, sessions,
//! messages, and the client records they reference.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
