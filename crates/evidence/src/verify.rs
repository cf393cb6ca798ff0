//! Evidence verification against historical chain state.

use noirbft_core_types::{
    DuplicateVoteEvidence, Evidence, Header, LightClientAttackEvidence, Timestamp, Validator,
    ValidatorSet,
};
use noirbft_store::{BlockStore, State, StateStore};
use tracing::debug;

use crate::Error;

/// Sub-classification of a light-client attack, derived by comparing the
/// trusted header with the conflicting one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttackType {
    /// The conflicting header invents state that never existed.
    Lunatic,
    /// Two blocks signed at the same height and round.
    Equivocation,
    /// A correct-looking block re-signed in a different round.
    Amnesia,
}

pub(crate) fn verify(
    evidence: &Evidence,
    state: &State,
    state_store: &StateStore,
    block_store: &BlockStore,
) -> Result<(), Error> {
    evidence.validate_basic()?;

    check_age(evidence, state)?;

    match evidence {
        Evidence::DuplicateVote(ev) => {
            let validators = state_store.load_validators(ev.vote_a.height)?;
            verify_duplicate_vote(ev, &state.chain_id, &validators)
        }
        Evidence::LightClientAttack(ev) => {
            let conflicting_height = ev.conflicting_block.signed_header.header.height;
            let common_validators = state_store.load_validators(ev.common_height)?;
            let trusted_header = block_store
                .load_block_meta(conflicting_height)?
                .map(|meta| meta.header);
            let trusted_round = block_store
                .load_block_commit(conflicting_height)?
                .map(|commit| commit.round);
            verify_light_client_attack(
                ev,
                &state.chain_id,
                &common_validators,
                trusted_header,
                trusted_round,
            )
            .map(|attack_type| {
                debug!(?attack_type, "Verified light client attack evidence");
            })
        }
    }
}

/// Evidence must be young in both block count and wall time.
fn check_age(evidence: &Evidence, state: &State) -> Result<(), Error> {
    let params = &state.consensus_params.evidence;
    let height = evidence.height();

    let age_num_blocks = state.last_block_height.as_i64() - height.as_i64();
    if age_num_blocks > params.max_age_num_blocks {
        return Err(Error::Expired {
            height,
            reason: format!(
                "{age_num_blocks} blocks old, max {}",
                params.max_age_num_blocks
            ),
        });
    }

    let age = state.last_block_time.elapsed_since(evidence.time());
    if age > params.max_age_duration {
        return Err(Error::Expired {
            height,
            reason: format!("{age:?} old, max {:?}", params.max_age_duration),
        });
    }
    Ok(())
}

pub(crate) fn verify_duplicate_vote(
    ev: &DuplicateVoteEvidence,
    chain_id: &str,
    validators: &ValidatorSet,
) -> Result<(), Error> {
    let address = ev.vote_a.validator_address;
    let (_, validator) = validators
        .get_by_address(&address)
        .ok_or_else(|| Error::Invalid(format!("validator {address} not in historical set")))?;

    // Powers recorded in the evidence must agree with the historical set.
    if ev.validator_power != validator.voting_power {
        return Err(Error::Invalid(format!(
            "validator power mismatch: evidence has {}, set has {}",
            ev.validator_power, validator.voting_power
        )));
    }
    if ev.total_voting_power != validators.total_voting_power() {
        return Err(Error::Invalid(format!(
            "total power mismatch: evidence has {}, set has {}",
            ev.total_voting_power,
            validators.total_voting_power()
        )));
    }

    let pub_key = validator
        .pub_key
        .ok_or_else(|| Error::Invalid(format!("no key for validator {address}")))?;
    let chain_id = chain_id.to_string();

    for vote in [&ev.vote_a, &ev.vote_b] {
        let signature = vote
            .signature
            .ok_or_else(|| Error::Invalid("unsigned vote in evidence".to_string()))?;
        pub_key
            .verify(&vote.sign_bytes(&chain_id), &signature)
            .map_err(|_| Error::Invalid("bad vote signature in evidence".to_string()))?;
    }
    Ok(())
}

pub(crate) fn verify_light_client_attack(
    ev: &LightClientAttackEvidence,
    chain_id: &str,
    common_validators: &ValidatorSet,
    trusted_header: Option<Header>,
    trusted_round: Option<noirbft_core_types::Round>,
) -> Result<AttackType, Error> {
    let conflicting = &ev.conflicting_block;
    let header = &conflicting.signed_header.header;
    let commit = &conflicting.signed_header.commit;

    if header.chain_id != chain_id {
        return Err(Error::Invalid("conflicting header is for another chain".to_string()));
    }

    // Every reported byzantine signer must be in the trusted set at the
    // common height and must actually have signed the conflicting commit.
    for byzantine in &ev.byzantine_validators {
        if !common_validators.has_address(&byzantine.address) {
            return Err(Error::Invalid(format!(
                "byzantine validator {} not in common validator set",
                byzantine.address
            )));
        }
        let signed = commit
            .signatures
            .iter()
            .any(|sig| sig.for_block() && sig.validator_address == byzantine.address);
        if !signed {
            return Err(Error::Invalid(format!(
                "byzantine validator {} did not sign the conflicting header",
                byzantine.address
            )));
        }
    }

    // The conflicting header must carry real signatures from its claimed
    // validator set.
    let block_id = noirbft_core_types::BlockId::new(
        header.hash()?,
        commit.block_id.part_set_header.clone(),
    );
    conflicting
        .validator_set
        .verify_commit_light(&chain_id.to_string(), &block_id, header.height, commit)
        .map_err(|e| Error::Invalid(format!("conflicting commit does not verify: {e}")))?;

    Ok(classify_attack(
        trusted_header.as_ref(),
        trusted_round,
        header,
        commit.round,
    ))
}

/// Compares the trusted header with the conflicting one.
fn classify_attack(
    trusted: Option<&Header>,
    trusted_round: Option<noirbft_core_types::Round>,
    conflicting: &Header,
    conflicting_round: noirbft_core_types::Round,
) -> AttackType {
    let Some(trusted) = trusted else {
        // No trusted header at that height: the attacker invented one
        // beyond the chain, which only a lunatic attack can do.
        return AttackType::Lunatic;
    };

    let state_fields_match = trusted.validators_hash == conflicting.validators_hash
        && trusted.next_validators_hash == conflicting.next_validators_hash
        && trusted.consensus_hash == conflicting.consensus_hash
        && trusted.app_hash == conflicting.app_hash
        && trusted.last_results_hash == conflicting.last_results_hash;

    if !state_fields_match {
        return AttackType::Lunatic;
    }
    if trusted_round == Some(conflicting_round) {
        AttackType::Equivocation
    } else {
        AttackType::Amnesia
    }
}

/// Builds the ABCI misbehavior records for a block's evidence list.
pub fn to_abci_evidence(
    evidence: &Evidence,
    time: Timestamp,
) -> Vec<noirbft_proto::abci::Misbehavior> {
    use noirbft_proto::abci::{EvidenceType, Misbehavior, ValidatorAbci};

    match evidence {
        Evidence::DuplicateVote(ev) => vec![Misbehavior {
            r#type: EvidenceType::DuplicateVote as i32,
            validator: Some(ValidatorAbci {
                address: ev.vote_a.validator_address.as_bytes().to_vec(),
                power: ev.validator_power,
            }),
            height: ev.vote_a.height.as_i64(),
            time: time.as_nanos(),
            total_voting_power: ev.total_voting_power,
        }],
        Evidence::LightClientAttack(ev) => ev
            .byzantine_validators
            .iter()
            .map(|validator: &Validator| Misbehavior {
                r#type: EvidenceType::LightClientAttack as i32,
                validator: Some(ValidatorAbci {
                    address: validator.address.as_bytes().to_vec(),
                    power: validator.voting_power,
                }),
                height: ev.common_height.as_i64(),
                time: time.as_nanos(),
                total_voting_power: ev.total_voting_power,
            })
            .collect(),
    }
}
