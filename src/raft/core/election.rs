//! Election timeout handling, candidacy, and the vote-grant rule.

use std::collections::BTreeMap;

use crate::error::RuntimeResult;
use crate::raft::replication::ReplicationHandle;
use crate::raft::storage::RaftStorage;
use crate::raft::types::*;
use crate::transport::MessageType;

use super::{FollowerStateInit, RaftCore};

impl<S: RaftStorage> RaftCore<S> {
    /// follower/candidate → candidate on election timeout, then
    /// campaigns for a strict majority (including self) before becoming
    /// leader.
    pub(super) async fn on_election_timeout(&mut self) -> RuntimeResult<()> {
        tracing::debug!("election timeout elapsed, becoming candidate");
        self.state = State::Candidate;
        self.start_election_campaign().await
    }

    /// Increment term, vote for self, persist, and campaign for a strict
    /// majority. Shared by `on_election_timeout` and `init_with_config`
    /// (the latter enters candidacy immediately for a multi-node initial
    /// cluster rather than waiting out a timeout).
    pub(crate) async fn start_election_campaign(&mut self) -> RuntimeResult<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.storage
            .save_hard_state(&HardState { current_term: self.current_term, voted_for: self.voted_for })
            .await
            .map_err(|e| self.fatal_storage_error(e))?;
        self.reset_election_timeout();
        self.publish_metrics();

        let quorum = self.membership.quorum_size();
        if quorum <= 1 {
            return self.become_leader().await;
        }

        let term = self.current_term;
        let last_log_id = self.last_log_id;
        let candidate_id = self.id;
        let peers: Vec<_> = self.membership.members.iter().copied().filter(|&p| p != self.id).collect();

        let mut futs = Vec::new();
        for peer in peers {
            let network = self.network.clone();
            let rpc = RequestVoteRequest { term, candidate_id, last_log_id };
            futs.push(tokio::spawn(async move {
                let body = serde_json::to_vec(&rpc).unwrap_or_default();
                let resp = network.request(peer, MessageType::RequestVote, term, body).await;
                resp.ok().and_then(|m| serde_json::from_slice::<RequestVoteResponse>(&m.body).ok())
            }));
        }

        let mut votes = 1usize; // self
        let mut highest_observed_term = term;
        for f in futs {
            if let Ok(Some(resp)) = f.await {
                highest_observed_term = highest_observed_term.max(resp.term);
                if resp.vote_granted {
                    votes += 1;
                }
            }
        }

        if self.state != State::Candidate || self.current_term != term {
            // A higher term or a different role transition arrived while
            // votes were outstanding; abandon this campaign.
            return Ok(());
        }
        if self.step_down_if_higher_term(highest_observed_term).await? {
            return Ok(());
        }

        if votes >= quorum {
            self.become_leader().await?;
        }
        Ok(())
    }

    /// Vote-grant rule: grant iff candidate's term >= own term,
    /// `votedFor` is unset or already this candidate, and the candidate's
    /// log is at least as up-to-date as ours.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_request_vote(
        &mut self,
        rpc: RequestVoteRequest,
    ) -> RuntimeResult<RequestVoteResponse> {
        if rpc.term < self.current_term {
            return Ok(RequestVoteResponse { term: self.current_term, vote_granted: false });
        }
        self.step_down_if_higher_term(rpc.term).await?;

        let log_ok = rpc.last_log_id >= self.last_log_id;
        let can_vote = self.voted_for.map_or(true, |v| v == rpc.candidate_id);

        if can_vote && log_ok {
            self.voted_for = Some(rpc.candidate_id);
            self.storage
                .save_hard_state(&HardState { current_term: self.current_term, voted_for: self.voted_for })
                .await
                .map_err(|e| self.fatal_storage_error(e))?;
            self.reset_election_timeout();
            tracing::debug!(candidate = rpc.candidate_id, "vote granted");
            Ok(RequestVoteResponse { term: self.current_term, vote_granted: true })
        } else {
            Ok(RequestVoteResponse { term: self.current_term, vote_granted: false })
        }
    }

    /// candidate → leader upon receiving votes from a strict majority,
    /// including self in the quorum calculation.
    pub(crate) async fn become_leader(&mut self) -> RuntimeResult<()> {
        tracing::info!(term = self.current_term, "becoming leader");
        self.state = State::Leader;
        self.current_leader = Some(self.id);

        let rx_leader_state = self.init_leader_state();
        let next_index = self.last_log_id.index + 1;
        let mut followers = BTreeMap::new();
        for &peer in self.membership.members.iter().filter(|&&p| p != self.id) {
            let handle = ReplicationHandle::spawn(
                self.id,
                peer,
                self.current_term,
                self.config.clone(),
                self.network.clone(),
                self.storage.clone(),
                rx_leader_state.clone(),
                next_index,
                self.tx_replica.clone(),
            );
            followers.insert(peer, FollowerStateInit { next_index, replication: handle });
        }
        self.install_followers(followers);

        // Leaders commit a blank entry at the start of their term, establishing `last_log_id.term == current_term`
        // before any other entry can be counted toward commit.
        let entry = self.append_entry_locally(EntryPayload::Blank).await?;
        self.replicate_entry(entry, None).await;
        self.publish_metrics();
        Ok(())
    }
}
