//! Membership-via-log: `configChange` entries are ordinary log
//! entries, interpreted only by the Raft core itself, applied atomically
//! at commit time. No joint consensus — at most one change is pending,
//! guarded by the 30s timeout in `RaftCore::check_pending_change_timeout`.

use std::collections::BTreeSet;

use crate::error::{ChangeConfigError, InitializeError, RuntimeResult};
use crate::raft::storage::RaftStorage;
use crate::raft::types::*;
use crate::NodeId;

use super::{FollowerStateInit, RaftCore};

impl<S: RaftStorage> RaftCore<S> {
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_init_with_config(&mut self, mut members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        if self.last_log_id.index != 0 || self.current_term != 0 {
            return Err(InitializeError::NotAllowed);
        }
        members.insert(self.id);
        self.membership = MembershipConfig { members };

        if self.membership.members.len() == 1 {
            self.current_term += 1;
            self.voted_for = Some(self.id);
            self.storage
                .save_hard_state(&HardState { current_term: self.current_term, voted_for: self.voted_for })
                .await
                .map_err(|e| InitializeError::RuntimeError(self.fatal_storage_error(e)))?;
            self.state = State::Candidate;
            self.become_leader().await.map_err(InitializeError::RuntimeError)?;
        } else {
            self.state = State::Candidate;
            self.start_election_campaign().await.map_err(InitializeError::RuntimeError)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_change_membership(
        &mut self,
        change: ConfigChange,
        tx: tokio::sync::oneshot::Sender<Result<(), ChangeConfigError>>,
    ) -> RuntimeResult<()> {
        if self.state != State::Leader {
            let _ = tx.send(Err(ChangeConfigError::RuntimeError(crate::error::RuntimeError::NotLeader(
                self.current_leader,
            ))));
            return Ok(());
        }
        if self.pending_change_is_set() {
            let _ = tx.send(Err(ChangeConfigError::ChangeInProgress));
            return Ok(());
        }
        if let Some(add) = change.add {
            if self.membership.members.contains(&add) {
                let _ = tx.send(Err(ChangeConfigError::Noop));
                return Ok(());
            }
        }
        if let Some(remove) = change.remove {
            if !self.membership.members.contains(&remove) {
                let _ = tx.send(Err(ChangeConfigError::Noop));
                return Ok(());
            }
            let mut after = self.membership.members.clone();
            after.remove(&remove);
            if after.is_empty() {
                let _ = tx.send(Err(ChangeConfigError::InoperableConfig));
                return Ok(());
            }
        }

        self.set_pending_change(change.clone(), tx);
        let entry = self.append_entry_locally(EntryPayload::ConfigChange(change)).await?;
        self.replicate_entry(entry, None).await;
        Ok(())
    }

    /// Applied at commit time on every replica.
    pub(super) fn apply_config_change(&mut self, change: ConfigChange) {
        if let Some(add) = change.add {
            self.membership.members.insert(add);
            if self.state == State::Leader && add != self.id && self.follower_replication(add).is_none() {
                if let Some(rx) = self.leader_state_receiver() {
                    let next_index = self.last_log_id.index + 1;
                    let handle = crate::raft::replication::ReplicationHandle::spawn(
                        self.id,
                        add,
                        self.current_term,
                        self.config.clone(),
                        self.network.clone(),
                        self.storage.clone(),
                        rx,
                        next_index,
                        self.tx_replica_sender(),
                    );
                    self.add_follower(add, FollowerStateInit { next_index, replication: handle });
                }
            }
        }
        if let Some(remove) = change.remove {
            self.membership.members.remove(&remove);
            self.remove_follower(remove);
            if remove == self.id {
                tracing::warn!("this node was removed from the cluster membership");
            }
        }
        self.publish_metrics();
        if let Some(tx) = self.take_pending_change_tx() {
            let _ = tx.send(Ok(()));
        }
        self.clear_pending_change();
    }
}
