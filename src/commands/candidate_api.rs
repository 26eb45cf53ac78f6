use crate::engine::Engine;
use crate::error::EngineError;
use crate::logger::dump_candidate;
use crate::peer::ice::{analyze_candidates, CandidateSummary};
use crate::peer::types::IceCandidate;

impl Engine {
    /// Feeds a remote candidate to `user_id`'s session. Before the answer is
    /// applied the candidate is queued; afterwards it goes straight to the
    /// connection.
    pub async fn add_remote_candidate(
        &self,
        user_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), EngineError> {
        let session = self
            .inner
            .registry
            .get(user_id)
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_owned()))?;
        dump_candidate("REMOTE", user_id, &candidate);

        match session.candidates().offer_remote(candidate) {
            Some(candidate) => {
                session.connection().add_ice_candidate(candidate).await?;
                log::debug!("[{user_id}] remote candidate applied");
            }
            None => log::debug!(
                "[{user_id}] remote candidate queued ({} pending)",
                session.candidates().pending_remote_len()
            ),
        }
        Ok(())
    }

    /// Local candidates gathered so far for `user_id`.
    pub fn local_candidates(&self, user_id: &str) -> Result<Vec<IceCandidate>, EngineError> {
        self.inner
            .registry
            .get(user_id)
            .map(|s| s.candidates().local())
            .ok_or_else(|| EngineError::SessionNotFound(user_id.to_owned()))
    }

    pub fn candidate_summary(&self, user_id: &str) -> Result<CandidateSummary, EngineError> {
        let local = self.local_candidates(user_id)?;
        Ok(analyze_candidates(&local))
    }
}
