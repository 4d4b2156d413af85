//! Leader-side commit advancement and client write/read handling, plus the
//! follower-side `AppendEntries` consistency check. Mirrors the split
//! between `async-raft::core::client` (leader write path) and the
//! follower-side RPC handling normally found in `append_entries.rs`.

use tokio::sync::oneshot;

use crate::error::{ClientReadError, RuntimeError, RuntimeResult};
use crate::raft::storage::RaftStorage;
use crate::raft::types::*;

use super::{PendingWrite, RaftCore};

impl<S: RaftStorage> RaftCore<S> {
    /// Append one entry to the local log (leader only), returning the
    /// stored entry. Does not itself wait for replication or commit.
    pub(super) async fn append_entry_locally(&mut self, payload: EntryPayload) -> RuntimeResult<Entry> {
        let log_id = LogId { term: self.current_term, index: self.last_log_id.index + 1 };
        let timestamp_ms = self
            .ctx
            .clock
            .wall_now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let entry = Entry { log_id, payload, timestamp_ms };
        self.storage
            .append_to_log(std::slice::from_ref(&entry))
            .await
            .map_err(|e| self.fatal_storage_error(e))?;
        self.last_log_id = log_id;
        self.publish_leader_state();
        Ok(entry)
    }

    /// Nudge every replication stream that new state is available, and
    /// track the write's response channel (if any) for when it commits.
    pub(super) async fn replicate_entry(&mut self, entry: Entry, tx: Option<oneshot::Sender<RuntimeResult<ClientWriteResponse>>>) {
        if self.membership.quorum_size() <= 1 {
            // Single-node cluster: the entry is already durable on the only
            // member, so it is committed immediately.
            self.commit_index = entry.log_id.index;
            self.publish_leader_state();
            let _ = self.apply_committed().await;
            if let Some(tx) = tx {
                let data = self.last_apply_response.take().unwrap_or_default();
                let _ = tx.send(Ok(ClientWriteResponse { log_id: entry.log_id, data }));
            }
            return;
        }
        if tx.is_some() {
            self.add_pending_write(entry.log_id.index, PendingWrite { entry: std::sync::Arc::new(entry), tx });
        }
        for peer in self.follower_ids() {
            if let Some(h) = self.follower_replication(peer) {
                h.nudge();
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, req))]
    pub(super) async fn handle_client_write(
        &mut self,
        req: ClientWriteRequest,
        tx: Option<oneshot::Sender<RuntimeResult<ClientWriteResponse>>>,
    ) -> RuntimeResult<()> {
        if self.state != State::Leader {
            if let Some(tx) = tx {
                let _ = tx.send(Err(RuntimeError::NotLeader(self.current_leader)));
            }
            return Ok(());
        }
        let entry = self.append_entry_locally(req.into_payload()).await?;
        self.replicate_entry(entry, tx).await;
        Ok(())
    }

    /// Linearizable read confirmation: a leader must verify it still holds
    /// quorum before answering a read. Simplified here to a leadership
    /// check backed by the last confirmed heartbeat round — a full
    /// round-trip read-index check is left as a caller concern if stronger
    /// guarantees are required.
    pub(super) async fn handle_client_read(&mut self) -> Result<(), ClientReadError> {
        if self.state != State::Leader {
            return Err(ClientReadError::RuntimeError(RuntimeError::NotLeader(self.current_leader)));
        }
        if self.follower_count() + 1 < self.membership.quorum_size() {
            return Err(ClientReadError::QuorumNotReached);
        }
        Ok(())
    }

    /// Advance `commit_index` to the largest `N` such that a majority of
    /// `match_index` >= `N` and `log[N].term == current_term` (prevents
    /// committing stale-term entries written by a previous leader).
    pub(super) async fn update_match_index(&mut self, target: crate::NodeId, index: u64) -> RuntimeResult<()> {
        self.set_follower_match_index(target, index);

        let quorum = self.membership.quorum_size();
        let mut match_indices: Vec<u64> = self.follower_match_indices();
        match_indices.push(self.last_log_id.index); // leader's own log
        match_indices.sort_unstable_by(|a, b| b.cmp(a));

        if match_indices.len() < quorum {
            return Ok(());
        }
        let candidate_n = match_indices[quorum - 1];

        if candidate_n > self.commit_index {
            if let Some(entry) = self.storage.try_get_log_entry(candidate_n).await.map_err(|e| self.fatal_storage_error(e))? {
                if entry.log_id.term == self.current_term {
                    self.commit_index = candidate_n;
                    self.publish_leader_state();
                    self.apply_committed().await?;
                }
            }
        }
        Ok(())
    }

    /// Apply loop: whenever `commit_index > last_applied`, apply each
    /// newly committed entry to the state machine, then resolve any
    /// pending client write waiting on that index.
    pub(super) async fn apply_committed(&mut self) -> RuntimeResult<()> {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = match self.storage.try_get_log_entry(next).await.map_err(|e| self.fatal_storage_error(e))? {
                Some(e) => e,
                None => break,
            };
            let response = self.apply_one(&entry).await?;
            self.last_applied = next;
            self.last_apply_response = Some(response.clone());
            if let Some(w) = self.take_pending_write(next) {
                if let Some(tx) = w.tx {
                    let _ = tx.send(Ok(ClientWriteResponse { log_id: entry.log_id, data: response }));
                }
            }
        }
        self.publish_metrics();
        Ok(())
    }

    async fn apply_one(&mut self, entry: &Entry) -> RuntimeResult<Vec<u8>> {
        match &entry.payload {
            EntryPayload::Blank => Ok(Vec::new()),
            EntryPayload::ConfigChange(change) => {
                self.apply_config_change(change.clone());
                Ok(Vec::new())
            }
            EntryPayload::Normal(_) => {
                let responses = self
                    .storage
                    .apply_to_state_machine(std::slice::from_ref(entry))
                    .await
                    .map_err(|e| self.fatal_storage_error(e))?;
                Ok(responses.into_iter().next().unwrap_or_default())
            }
        }
    }

    /// Follower-side `AppendEntries` handling, implementing the log
    /// consistency check and truncate-on-conflict rule.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_append_entries(&mut self, rpc: AppendEntriesRequest) -> RuntimeResult<AppendEntriesResponse> {
        if rpc.term < self.current_term {
            return Ok(AppendEntriesResponse { term: self.current_term, success: false, conflict_index: None });
        }
        self.step_down_if_higher_term(rpc.term).await?;
        self.current_leader = Some(rpc.leader_id);
        self.reset_election_timeout_for_heartbeat();

        if rpc.prev_log_id.index > 0 {
            match self.storage.try_get_log_entry(rpc.prev_log_id.index).await.map_err(|e| self.fatal_storage_error(e))? {
                Some(e) if e.log_id.term == rpc.prev_log_id.term => {}
                _ => {
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: Some(rpc.prev_log_id.index.saturating_sub(1).max(1)),
                    });
                }
            }
        }

        for new_entry in &rpc.entries {
            if let Some(existing) = self.storage.try_get_log_entry(new_entry.log_id.index).await.map_err(|e| self.fatal_storage_error(e))? {
                if existing.log_id.term != new_entry.log_id.term {
                    self.storage.delete_logs_from(new_entry.log_id.index).await.map_err(|e| self.fatal_storage_error(e))?;
                    self.storage.append_to_log(std::slice::from_ref(new_entry)).await.map_err(|e| self.fatal_storage_error(e))?;
                }
                // identical entry already present: no-op, supports idempotent re-delivery.
            } else {
                self.storage.append_to_log(std::slice::from_ref(new_entry)).await.map_err(|e| self.fatal_storage_error(e))?;
            }
            self.last_log_id = new_entry.log_id;
        }

        if rpc.leader_commit > self.commit_index {
            self.commit_index = rpc.leader_commit.min(self.last_log_id.index);
            self.apply_committed().await?;
        }

        Ok(AppendEntriesResponse { term: self.current_term, success: true, conflict_index: None })
    }

    /// Follower-side `InstallSnapshot` handling: replace local log/state up
    /// through the snapshot's `last_log_id` and adopt its membership.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest,
    ) -> RuntimeResult<InstallSnapshotResponse> {
        if rpc.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }
        self.step_down_if_higher_term(rpc.term).await?;
        self.current_leader = Some(rpc.leader_id);
        self.reset_election_timeout_for_heartbeat();

        self.storage
            .finalize_snapshot_installation(&rpc.meta, rpc.data)
            .await
            .map_err(|e| self.fatal_storage_error(e))?;

        self.last_log_id = rpc.meta.last_log_id;
        self.commit_index = self.commit_index.max(rpc.meta.last_log_id.index);
        self.last_applied = self.last_applied.max(rpc.meta.last_log_id.index);
        self.membership = rpc.meta.membership;
        self.publish_metrics();

        Ok(InstallSnapshotResponse { term: self.current_term })
    }
}
