/// Core storage engine for Celerix Store.
///
/// This module contains the in-memory store, filesystem persistence,
/// cross-store migration, and security primitives.
pub mod memstore;
/// Cross-store data migration.
pub mod migration;
/// Filesystem persistence logic.
pub mod persistence;
/// Cryptographic utilities: client-side encryption and TLS certificates.
pub mod vault;

pub use memstore::MemStore;
pub use migration::migrate;
pub use persistence::Persistence;
