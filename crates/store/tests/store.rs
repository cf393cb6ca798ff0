use rand::rngs::StdRng;
use rand::SeedableRng;

use noirbft_core_types::{
    Address, Block, BlockId, BlockIdFlag, Commit, CommitSig, ConsensusParams, Data, EvidenceList,
    GenesisDoc, GenesisValidator, Header, Height, PartSetHeader, PrivateKey, Round, Signature,
    Timestamp, Validator, ValidatorSet, Version,
};
use noirbft_store::{BlockStore, State, StateStore};

fn make_block(height: u64) -> Block {
    let data = Data {
        txs: vec![format!("tx-{height}-0").into_bytes(), b"tx-1".to_vec()],
    };
    let evidence = EvidenceList::default();
    let last_commit = Commit::new(
        Height::new(height - 1),
        Round::new(0),
        BlockId::new(vec![1; 32], PartSetHeader::new(1, vec![2; 32])),
        vec![CommitSig {
            block_id_flag: BlockIdFlag::Commit,
            validator_address: Address::new([7; 20]),
            timestamp: Timestamp::from_nanos(40),
            signature: Signature::try_from([1u8; 64].as_slice()).ok(),
        }],
    );

    let mut header = Header {
        version: Version { block: 11, app: 1 },
        chain_id: "test-chain".to_string(),
        height: Height::new(height),
        time: Timestamp::from_nanos(height as i64 * 1_000),
        last_block_id: BlockId::new(vec![1; 32], PartSetHeader::new(1, vec![2; 32])),
        last_commit_hash: Vec::new(),
        data_hash: data.hash(),
        validators_hash: vec![3; 32],
        next_validators_hash: vec![4; 32],
        consensus_hash: vec![5; 32],
        app_hash: vec![6; 32],
        last_results_hash: vec![7; 32],
        evidence_hash: evidence.hash().unwrap(),
        proposer_address: Address::new([8; 20]),
    };
    header.last_commit_hash = last_commit.hash().unwrap();

    Block {
        header,
        data,
        evidence,
        last_commit,
    }
}

fn seen_commit(height: u64, block: &Block) -> Commit {
    let parts = block.make_part_set(64).unwrap();
    Commit::new(
        Height::new(height),
        Round::new(0),
        BlockId::new(block.hash().unwrap(), parts.header()),
        vec![CommitSig {
            block_id_flag: BlockIdFlag::Commit,
            validator_address: Address::new([9; 20]),
            timestamp: Timestamp::from_nanos(90),
            signature: Signature::try_from([2u8; 64].as_slice()).ok(),
        }],
    )
}

#[test]
fn block_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path().join("blockstore.redb")).unwrap();

    assert!(store.base().unwrap().is_none());
    assert!(store.height().unwrap().is_none());

    for h in 2..=5u64 {
        let block = make_block(h);
        let parts = block.make_part_set(64).unwrap();
        store
            .save_block(&block, &parts, &seen_commit(h, &block))
            .unwrap();
    }

    assert_eq!(store.base().unwrap(), Some(Height::new(2)));
    assert_eq!(store.height().unwrap(), Some(Height::new(5)));

    let block = store.load_block(Height::new(3)).unwrap().unwrap();
    assert_eq!(block, make_block(3));

    let meta = store.load_block_meta(Height::new(3)).unwrap().unwrap();
    assert_eq!(meta.header.height, Height::new(3));
    assert_eq!(meta.num_txs, 2);

    // Block 4's last-commit is the canonical commit for height 3.
    let commit = store.load_block_commit(Height::new(3)).unwrap().unwrap();
    assert_eq!(commit, make_block(4).last_commit);

    let seen = store.load_seen_commit(Height::new(5)).unwrap().unwrap();
    assert_eq!(seen.height, Height::new(5));

    assert!(store.load_block(Height::new(17)).unwrap().is_none());
}

#[test]
fn block_store_prune() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path().join("blockstore.redb")).unwrap();

    for h in 2..=8u64 {
        let block = make_block(h);
        let parts = block.make_part_set(64).unwrap();
        store
            .save_block(&block, &parts, &seen_commit(h, &block))
            .unwrap();
    }

    let pruned = store.prune(Height::new(6)).unwrap();
    assert_eq!(pruned, 4);
    assert_eq!(store.base().unwrap(), Some(Height::new(6)));
    assert!(store.load_block(Height::new(5)).unwrap().is_none());
    assert!(store.load_block(Height::new(6)).unwrap().is_some());

    // Pruning below the base is a no-op.
    assert_eq!(store.prune(Height::new(3)).unwrap(), 0);
}

fn genesis() -> GenesisDoc {
    let key = PrivateKey::generate(StdRng::seed_from_u64(1));
    GenesisDoc {
        genesis_time: Timestamp::from_nanos(1),
        chain_id: "test-chain".to_string(),
        initial_height: 1,
        consensus_params: ConsensusParams::default(),
        validators: vec![GenesisValidator {
            pub_key: hex::encode(key.public_key().as_bytes()),
            power: 10,
            name: String::new(),
        }],
        app_hash: Vec::new(),
        app_state: serde_json::Value::Null,
    }
}

#[test]
fn state_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.redb")).unwrap();

    assert!(store.load().unwrap().is_none());

    let state = State::from_genesis(&genesis()).unwrap();
    store.bootstrap(&state).unwrap();

    let loaded = store.load().unwrap().unwrap();
    assert_eq!(loaded, state);

    let validators = store.load_validators(Height::new(1)).unwrap();
    assert_eq!(validators, state.validators);

    let params = store.load_consensus_params(Height::new(1)).unwrap();
    assert_eq!(params, state.consensus_params);
}

#[test]
fn validators_back_reference() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.redb")).unwrap();

    let key = PrivateKey::generate(StdRng::seed_from_u64(2));
    let set = ValidatorSet::new([Validator::new(key.public_key(), 7)]).unwrap();

    // Set changed at height 3; heights 4 and 5 only reference back.
    store.save_validators(Height::new(3), Height::new(3), &set).unwrap();
    store.save_validators(Height::new(4), Height::new(3), &set).unwrap();
    store.save_validators(Height::new(5), Height::new(3), &set).unwrap();

    assert_eq!(store.load_validators(Height::new(5)).unwrap(), set);
    assert!(store.load_validators(Height::new(9)).is_err());
}

#[test]
fn abci_responses_round_trip() {
    use noirbft_proto::abci::{AbciResponses, ResponseDeliverTx, ResponseEndBlock};

    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.redb")).unwrap();

    let responses = AbciResponses {
        deliver_txs: vec![ResponseDeliverTx {
            code: 0,
            data: b"result".to_vec(),
            log: String::new(),
            gas_wanted: 10,
            gas_used: 7,
            events: Vec::new(),
        }],
        begin_block: None,
        end_block: Some(ResponseEndBlock {
            validator_updates: Vec::new(),
            consensus_param_updates: None,
            events: Vec::new(),
        }),
    };

    store
        .save_abci_responses(Height::new(12), &responses)
        .unwrap();
    assert_eq!(
        store.load_abci_responses(Height::new(12)).unwrap().unwrap(),
        responses
    );
    assert!(store.load_abci_responses(Height::new(13)).unwrap().is_none());
}
