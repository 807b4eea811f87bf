//! Challenge intake: a minority answer contradicted by a signed majority

use crate::error::ViperError;
use crate::runtime::Runtime;
use std::collections::HashSet;
use tracing::info;
use vipernet_core::crypto;
use vipernet_core::*;

/// Body of a successful challenge acknowledgement
pub const CHALLENGE_ACK: &str = "success";

/// Smallest majority a challenge must carry
pub const MIN_MAJORITY: usize = 2;

fn invalid(reason: impl Into<String>) -> ViperError {
    ViperError::InvalidChallenge(reason.into())
}

/// Session-independent checks of a challenge.
///
/// Every response must be validly signed by its servicer and belong to
/// one session and request; the majority must agree and the minority must
/// differ; each servicer may appear once.
pub fn check_challenge(challenge: &ChallengeProofInvalidData) -> Result<SessionHeader, ViperError> {
    if challenge.majority_responses.len() < MIN_MAJORITY {
        return Err(invalid(format!(
            "need at least {MIN_MAJORITY} majority responses, got {}",
            challenge.majority_responses.len()
        )));
    }
    let minority = &challenge.minority_response;
    let header = challenge.session_header();
    header.validate_basic()?;
    let request_hash = minority.proof.request_hash;
    let majority_body = &challenge.majority_responses[0].response;

    let mut servicers = HashSet::new();
    for response in challenge
        .majority_responses
        .iter()
        .chain(std::iter::once(minority))
    {
        response
            .verify()
            .map_err(|e| invalid(format!("response signature: {e}")))?;
        if response.proof.session_header() != header {
            return Err(invalid("responses belong to different sessions"));
        }
        if response.proof.request_hash != request_hash {
            return Err(invalid("responses answer different requests"));
        }
        if !servicers.insert(response.proof.servicer_pubkey) {
            return Err(invalid(format!(
                "servicer {} answered twice",
                response.proof.servicer_pubkey
            )));
        }
    }
    if challenge
        .majority_responses
        .iter()
        .any(|r| &r.response != majority_body)
    {
        return Err(invalid("majority responses disagree"));
    }
    if &minority.response == majority_body {
        return Err(invalid("minority response matches the majority"));
    }
    Ok(header)
}

impl Runtime {
    /// `POST /v1/client/challenge`
    ///
    /// Stored by the first local identity serving the session.
    pub async fn handle_challenge(
        &self,
        challenge: ChallengeProofInvalidData,
    ) -> Result<ChallengeResponse, ViperError> {
        let header = check_challenge(&challenge)?;
        let height = self.current_height().await?;

        let mut storing = None;
        for node in self.nodes() {
            let session = node
                .sessions
                .get_or_derive(self.chain(), &header, height)
                .await?;
            if session.has_servicer(&node.address()) {
                storing = Some((node.clone(), session));
                break;
            }
        }
        let Some((node, session)) = storing else {
            let first = self.nodes().next().map(|n| n.address()).unwrap_or(Address([0; 20]));
            return Err(ViperError::NodeNotInSession(first));
        };

        for response in challenge
            .majority_responses
            .iter()
            .chain(std::iter::once(&challenge.minority_response))
        {
            let servicer = response.proof.servicer_pubkey.address();
            if !session.has_servicer(&servicer) {
                return Err(invalid(format!("{servicer} is not a servicer of the session")));
            }
        }

        let unique = challenge.unique_key()?;
        let minority = challenge.minority_response.proof.servicer_pubkey.address();
        node.evidence
            .set_proof(&header, &node.address(), Proof::Challenge(challenge), None)?;
        self.metrics()
            .proofs_stored
            .with_label_values(&["challenge"])
            .inc();
        info!(
            node = %node.address(),
            minority = %minority,
            session = header.session_block_height,
            "challenge evidence stored"
        );

        let digest = crypto::hash_parts(&[CHALLENGE_ACK.as_bytes(), &unique.0]);
        Ok(ChallengeResponse {
            response: CHALLENGE_ACK.to_string(),
            servicer_pubkey: node.public_key(),
            signature: node.keypair().sign(&digest.0),
        })
    }
}
