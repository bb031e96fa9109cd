//! Cache store contract and its error taxonomy.

use thiserror::Error;

use crate::http::ResponseSnapshot;

/// Storage failure opening or writing a cache generation. Fatal to the
/// operation that hit it; never retried automatically.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
  #[error("failed to open store: {0}")]
  Open(String),
  #[error("store operation failed: {0}")]
  Query(String),
  #[error("store lock poisoned")]
  Lock,
}

/// Trait for generation-scoped response cache backends.
///
/// A generation is a named, versioned collection of request-key ->
/// response-snapshot entries. Invalidation is wholesale: activation keeps
/// the current generation names and drops everything else.
pub trait CacheStore: Send + Sync {
  /// Idempotently register a named generation.
  fn ensure(&self, generation: &str) -> Result<(), StorageError>;

  /// Store a snapshot under a request key, overwriting any existing entry.
  fn put(
    &self,
    generation: &str,
    request_key: &str,
    snapshot: &ResponseSnapshot,
  ) -> Result<(), StorageError>;

  /// Look up a snapshot by request key. A miss is `None`, not an error.
  fn lookup(
    &self,
    generation: &str,
    request_key: &str,
  ) -> Result<Option<ResponseSnapshot>, StorageError>;

  /// Delete every generation (and its entries) not named in `keep`.
  /// Called once at activation; idempotent.
  fn reconcile_generations(&self, keep: &[String]) -> Result<(), StorageError>;

  /// Names of all registered generations.
  fn generation_names(&self) -> Result<Vec<String>, StorageError>;
}
