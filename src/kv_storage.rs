//! The Storage collaborator: durable key→bytes storage with atomic
//! put/get/delete and prefix scan. Raft persistent state and event appends
//! require fsync-on-commit; this trait exposes that as an explicit `durable`
//! flag on writes rather than leaving it implicit.

use async_trait::async_trait;

use crate::error::RuntimeResult;

/// A durable, byte-oriented key-value collaborator. The on-disk layout in
/// (`raft/<nodeId>/meta`, `events/<partition>/<streamId>`, ...) is
/// logical: callers choose key prefixes, this trait only promises
/// durability and prefix scan.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Write `value` under `key`. When `durable` is set the implementation
    /// must fsync (or equivalent) before returning, as required for Raft
    /// persistent state and event appends.
    async fn put(&self, key: &[u8], value: &[u8], durable: bool) -> RuntimeResult<()>;

    async fn get(&self, key: &[u8]) -> RuntimeResult<Option<Vec<u8>>>;

    async fn delete(&self, key: &[u8]) -> RuntimeResult<()>;

    /// Return all `(key, value)` pairs whose key starts with `prefix`,
    /// ordered by key.
    async fn scan_prefix(&self, prefix: &[u8]) -> RuntimeResult<Vec<(Vec<u8>, Vec<u8>)>>;
}
