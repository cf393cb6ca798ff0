use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use noirbft_core_types::{
    BlockId, ConsensusParams, DuplicateVoteEvidence, Evidence, EvidenceList, GenesisDoc,
    GenesisValidator, Height, PartSetHeader, PrivateKey, Round, Timestamp, Vote, VoteType,
};
use noirbft_evidence::{Error, Pool, PoolConfig};
use noirbft_store::{BlockStore, State, StateStore};

struct Fixture {
    pool: Pool,
    state: State,
    keys: Vec<PrivateKey>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let mut rng = StdRng::seed_from_u64(7);
    let keys: Vec<PrivateKey> = (0..3).map(|_| PrivateKey::generate(&mut rng)).collect();

    let genesis = GenesisDoc {
        genesis_time: Timestamp::from_nanos(0),
        chain_id: "evidence-chain".to_string(),
        initial_height: 1,
        consensus_params: ConsensusParams::default(),
        validators: keys
            .iter()
            .enumerate()
            .map(|(i, key)| GenesisValidator {
                pub_key: hex::encode(key.public_key().as_bytes()),
                power: 10,
                name: format!("val-{i}"),
            })
            .collect(),
        app_hash: Vec::new(),
        app_state: serde_json::Value::Null,
    };

    let dir = tempfile::tempdir().unwrap();
    let state_store = StateStore::open(dir.path().join("state.redb")).unwrap();
    let block_store = BlockStore::open(dir.path().join("blocks.redb")).unwrap();

    let mut state = State::from_genesis(&genesis).unwrap();
    // Full validator set recorded at height 1.
    state_store.bootstrap(&state).unwrap();

    // Pretend the chain has advanced to height 20.
    state.last_block_height = Height::new(20);
    state.last_block_time = Timestamp::from_nanos(20_000);
    state_store.save(&state).unwrap();
    state_store
        .save_validators(Height::new(10), Height::new(1), &state.validators)
        .unwrap();

    let pool = Pool::open(
        dir.path().join("evidence.redb"),
        PoolConfig::default(),
        state.clone(),
        state_store,
        block_store,
    )
    .unwrap();

    Fixture {
        pool,
        state,
        keys,
        _dir: dir,
    }
}

fn signed_vote(fixture: &Fixture, key_index: usize, height: u64, block_seed: u8) -> Vote {
    let key = &fixture.keys[key_index];
    let mut vote = Vote {
        vote_type: VoteType::Prevote,
        height: Height::new(height),
        round: Round::new(0),
        block_id: BlockId::new(
            vec![block_seed; 32],
            PartSetHeader::new(1, vec![block_seed; 32]),
        ),
        timestamp: Timestamp::from_nanos(10_000),
        validator_address: key.public_key().address(),
        validator_index: 0,
        signature: None,
        extension: Vec::new(),
    };
    vote.signature = Some(key.sign(&vote.sign_bytes(&fixture.state.chain_id)));
    vote
}

fn duplicate_vote_evidence(fixture: &Fixture, height: u64) -> Evidence {
    let vote_a = signed_vote(fixture, 0, height, 0x0a);
    let vote_b = signed_vote(fixture, 0, height, 0x0b);
    Evidence::DuplicateVote(
        DuplicateVoteEvidence::new(
            vote_a,
            vote_b,
            Timestamp::from_nanos(10_000),
            &fixture.state.validators,
        )
        .unwrap(),
    )
}

#[test]
fn valid_evidence_is_admitted_once() {
    let fixture = fixture();
    let evidence = duplicate_vote_evidence(&fixture, 10);

    assert!(fixture.pool.add_evidence(evidence.clone()).unwrap());
    assert_eq!(fixture.pool.pending_count(), 1);

    // Duplicate admission is a quiet no-op.
    assert!(!fixture.pool.add_evidence(evidence).unwrap());
    assert_eq!(fixture.pool.pending_count(), 1);
}

#[test]
fn tampered_signature_rejected() {
    let fixture = fixture();

    let vote_a = signed_vote(&fixture, 0, 10, 0x0a);
    let mut vote_b = signed_vote(&fixture, 0, 10, 0x0b);
    // Signature by the wrong key.
    vote_b.signature = Some(
        fixture.keys[1].sign(&vote_b.sign_bytes(&fixture.state.chain_id)),
    );

    let evidence = Evidence::DuplicateVote(
        DuplicateVoteEvidence::new(
            vote_a,
            vote_b,
            Timestamp::from_nanos(10_000),
            &fixture.state.validators,
        )
        .unwrap(),
    );

    assert!(matches!(
        fixture.pool.add_evidence(evidence),
        Err(Error::Invalid(_))
    ));
    assert_eq!(fixture.pool.pending_count(), 0);
}

#[test]
fn expired_evidence_rejected() {
    let fixture = fixture();

    // Old in wall time: the chain tip is far past the age window.
    let vote_a = signed_vote(&fixture, 0, 10, 0x0a);
    let vote_b = signed_vote(&fixture, 0, 10, 0x0b);
    let mut ev = DuplicateVoteEvidence::new(
        vote_a,
        vote_b,
        Timestamp::from_nanos(10_000),
        &fixture.state.validators,
    )
    .unwrap();
    ev.timestamp = Timestamp::from_nanos(
        fixture.state.last_block_time.as_nanos()
            - Duration::from_secs(72 * 60 * 60).as_nanos() as i64,
    );

    assert!(matches!(
        fixture.pool.add_evidence(Evidence::DuplicateVote(ev)),
        Err(Error::Expired { .. })
    ));
}

#[test]
fn committed_evidence_is_deduped_and_rejected() {
    let fixture = fixture();
    let evidence = duplicate_vote_evidence(&fixture, 10);

    fixture.pool.add_evidence(evidence.clone()).unwrap();

    let committed = EvidenceList::new(vec![evidence.clone()]);
    fixture
        .pool
        .update(fixture.state.clone(), &committed)
        .unwrap();

    assert_eq!(fixture.pool.pending_count(), 0);
    // Re-adding committed evidence is a no-op.
    assert!(!fixture.pool.add_evidence(evidence).unwrap());

    // A proposed block carrying it again must be rejected.
    assert!(matches!(
        fixture.pool.check_evidence(&committed),
        Err(Error::AlreadyCommitted)
    ));
}

#[test]
fn check_evidence_accepts_fresh_list() {
    let fixture = fixture();
    let list = EvidenceList::new(vec![duplicate_vote_evidence(&fixture, 10)]);
    fixture.pool.check_evidence(&list).unwrap();
}

#[test]
fn report_conflicting_votes_builds_ordered_evidence() {
    let fixture = fixture();

    let vote_high = signed_vote(&fixture, 0, 10, 0x0b);
    let vote_low = signed_vote(&fixture, 0, 10, 0x0a);

    assert!(fixture
        .pool
        .report_conflicting_votes(vote_high, vote_low.clone(), Timestamp::from_nanos(10_000))
        .unwrap());

    let pending = fixture.pool.pending_evidence(i64::MAX).unwrap();
    assert_eq!(pending.len(), 1);
    match &pending[0] {
        Evidence::DuplicateVote(ev) => {
            assert_eq!(ev.vote_a, vote_low);
            assert!(ev.vote_a.block_id.key() < ev.vote_b.block_id.key());
        }
        other => panic!("unexpected evidence: {other:?}"),
    }
}
