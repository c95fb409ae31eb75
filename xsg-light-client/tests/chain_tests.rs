//! End-to-end tests over real header files: linear growth, chunk
//! acceptance, fork creation, the file-swap reorg and the bootstrap scan.

use std::fs;
use std::sync::Arc;

use xsg_light_client::{read_blockchains, Blockchain, ChainManager, ChunkHeaders, ClientConfig};
use xsg_types::header::{header_size, HDR_LEN};
use xsg_types::network::{NetworkParams, Target, MAX_TARGET, MIN_TARGET};
use xsg_types::{Header, H256, U256};

const BASE_TIME: u32 = 1_600_000_000;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn time_at(height: i64) -> u32 {
    BASE_TIME + height as u32 * 60
}

fn mine_header(prev_hash: &H256, height: i64, time: u32, target: &Target) -> Header {
    let bits = target.target_to_bits();
    let mut counter: u64 = 0;
    loop {
        let mut nonce = [0u8; 32];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        let header = Header {
            version: 4,
            prev_block_hash: prev_hash.clone(),
            merkle_root: H256::ZERO,
            reserved_hash: H256::ZERO,
            time,
            bits,
            nonce: H256(nonce),
            solution: Vec::new(),
            block_height: height,
        };
        if U256::from_le_bytes(&header.block_hash().0) <= *target {
            return header;
        }
        counter += 1;
    }
}

fn setup() -> (tempfile::TempDir, ClientConfig, NetworkParams, Header) {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let genesis = mine_header(&H256::ZERO, 0, BASE_TIME, &MAX_TARGET);
    let params = NetworkParams {
        genesis: genesis.block_hash(),
        testnet: false,
        checkpoints: Vec::new(),
    };
    let config = ClientConfig::new(dir.path());
    (dir, config, params, genesis)
}

/// Bootstraps a manager and stores the genesis header on the trunk.
fn boot(config: &ClientConfig, params: &NetworkParams, genesis: &Header) -> ChainManager {
    let manager = read_blockchains(config, params.clone()).unwrap();
    let trunk = manager.best_chain();
    assert!(trunk.can_connect(genesis, true));
    trunk.save_header(&manager, genesis).unwrap();
    manager
}

/// Mines and saves `count` headers on top of `chain`.
fn extend(manager: &ChainManager, chain: &Arc<Blockchain>, count: usize) -> Vec<Header> {
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let height = chain.height() + 1;
        let prev = chain.get_hash(height - 1).unwrap();
        let target = chain.get_target(height, None).unwrap();
        let header = mine_header(&prev, height, time_at(height), &target);
        chain.save_header(manager, &header).unwrap();
        headers.push(header);
    }
    headers
}

/// Mines a header competing with the one `chain` has at `height`.
fn competing_header(chain: &Arc<Blockchain>, height: i64, time_salt: u32) -> Header {
    let prev = chain.get_hash(height - 1).unwrap();
    let target = chain.get_target(height, None).unwrap();
    mine_header(&prev, height, time_at(height) + time_salt, &target)
}

/// An unmined header for feeding retarget windows through the in-flight
/// context.
fn context_header(height: i64, bits: u32) -> Header {
    Header {
        version: 4,
        prev_block_hash: H256::ZERO,
        merkle_root: H256::ZERO,
        reserved_hash: H256::ZERO,
        time: time_at(height),
        bits,
        nonce: H256::ZERO,
        solution: vec![0; header_size(height) - HDR_LEN],
        block_height: height,
    }
}

#[test]
fn genesis_only_boot() {
    let (_dir, config, params, genesis) = setup();
    let manager = read_blockchains(&config, params.clone()).unwrap();

    assert_eq!(manager.chain_count(), 1);
    let trunk = manager.best_chain();
    assert_eq!(trunk.get_id(), params.genesis);
    assert_eq!(trunk.height(), -1);
    assert_eq!(trunk.get_hash(-1).unwrap(), H256::ZERO);
    assert_eq!(trunk.get_hash(0).unwrap(), params.genesis);

    trunk.save_header(&manager, &genesis).unwrap();
    assert_eq!(trunk.height(), 0);
    assert_eq!(trunk.header_at_tip().unwrap().unwrap(), genesis);
}

#[test]
fn linear_extension_grows_the_file() {
    let (dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();

    let headers = extend(&manager, &trunk, 5);
    assert_eq!(trunk.height(), 5);

    let len_before = fs::metadata(dir.path().join("blockchain_headers"))
        .unwrap()
        .len();
    let next = competing_header(&trunk, 6, 0);
    let found = manager.can_connect(&next).expect("header should connect");
    assert!(Arc::ptr_eq(&found, &trunk));
    trunk.save_header(&manager, &next).unwrap();

    assert_eq!(trunk.height(), 6);
    let len_after = fs::metadata(dir.path().join("blockchain_headers"))
        .unwrap()
        .len();
    assert_eq!(len_after - len_before, header_size(6) as u64);

    // every stored header answers its own hash
    for header in &headers {
        assert!(trunk.check_header(header));
    }
    assert_eq!(
        trunk.get_hash(3).unwrap(),
        headers[2].block_hash(),
    );
}

#[test]
fn connect_chunk_accepts_and_is_idempotent() {
    let (dir, config, params, genesis) = setup();
    let manager = read_blockchains(&config, params.clone()).unwrap();
    let trunk = manager.best_chain();

    // build chunk 0 by hand: genesis plus four mined successors
    let mut data = genesis.serialize();
    let mut prev = genesis.block_hash();
    for height in 1..5 {
        let header = mine_header(&prev, height, time_at(height), &MAX_TARGET);
        prev = header.block_hash();
        data.extend_from_slice(&header.serialize());
    }
    let hexdata = hex::encode(&data);

    assert!(trunk.connect_chunk(&manager, 0, &hexdata));
    assert_eq!(trunk.height(), 4);
    let file_state = fs::read(dir.path().join("blockchain_headers")).unwrap();

    // a second delivery of the same chunk is accepted and changes nothing
    assert!(trunk.connect_chunk(&manager, 0, &hexdata));
    assert_eq!(trunk.height(), 4);
    assert_eq!(
        fs::read(dir.path().join("blockchain_headers")).unwrap(),
        file_state
    );
}

#[test]
fn connect_chunk_rejects_tampering() {
    let (_dir, config, params, genesis) = setup();
    let manager = read_blockchains(&config, params.clone()).unwrap();
    let trunk = manager.best_chain();

    let mut headers = vec![genesis.clone()];
    let mut prev = genesis.block_hash();
    for height in 1..5 {
        let header = mine_header(&prev, height, time_at(height), &MAX_TARGET);
        prev = header.block_hash();
        headers.push(header);
    }
    let data: Vec<u8> = headers.iter().flat_map(Header::serialize).collect();

    // bad bits in the third record
    let mut tampered = data.clone();
    tampered[2 * HDR_LEN + 104] ^= 0x01;
    assert!(!trunk.connect_chunk(&manager, 0, &hex::encode(&tampered)));
    assert_eq!(trunk.height(), -1);

    // broken linkage: swap two records
    let mut reordered = headers.clone();
    reordered.swap(2, 3);
    let data: Vec<u8> = reordered.iter().flat_map(Header::serialize).collect();
    assert!(!trunk.connect_chunk(&manager, 0, &hex::encode(&data)));
    assert_eq!(trunk.height(), -1);

    // not even hex
    assert!(!trunk.connect_chunk(&manager, 0, "zz"));
}

#[test]
fn fork_below_trunk_tip_does_not_swap() {
    let (dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    let trunk_headers = extend(&manager, &trunk, 5);

    let rival = competing_header(&trunk, 3, 7);
    assert!(manager.check_header(&rival).is_none());
    assert!(manager.can_connect(&rival).is_none());

    let fork = manager.fork(&trunk, &rival).unwrap();
    assert_eq!(manager.chain_count(), 2);
    assert_eq!(fork.height(), 3);
    assert_eq!(fork.forkpoint(), 3);
    assert_eq!(fork.get_id(), rival.block_hash());

    // the trunk is untouched and still the best chain
    assert!(Arc::ptr_eq(&manager.best_chain(), &trunk));
    assert_eq!(trunk.height(), 5);
    assert_eq!(trunk.get_hash(3).unwrap(), trunk_headers[2].block_hash());

    // the fork answers its own tip but shares the trunk below the forkpoint
    assert_eq!(fork.get_hash(3).unwrap(), rival.block_hash());
    assert_eq!(fork.get_hash(2).unwrap(), trunk_headers[1].block_hash());

    let fork_files: Vec<_> = fs::read_dir(dir.path().join("forks"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(fork_files.len(), 1);
    assert!(fork_files[0].starts_with("fork2_3_"));
}

#[test]
fn fork_overtakes_trunk_and_bootstrap_is_idempotent() {
    let (dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    let trunk_headers = extend(&manager, &trunk, 5);
    let t1 = trunk_headers[0].block_hash();
    let t3 = trunk_headers[2].block_hash();

    // a sibling branch rooted below the upcoming fork
    let sibling_head = competing_header(&trunk, 2, 11);
    let sibling = manager.fork(&trunk, &sibling_head).unwrap();

    // the contender forks at height 3 and grows past the trunk
    let rival = competing_header(&trunk, 3, 7);
    let fork = manager.fork(&trunk, &rival).unwrap();
    let mut fork_headers = vec![rival];
    fork_headers.extend(extend(&manager, &fork, 2));
    assert_eq!(fork.height(), 5);
    assert!(Arc::ptr_eq(&manager.best_chain(), &trunk));

    // one more header tips the balance: files and identities swap
    fork_headers.extend(extend(&manager, &fork, 1));
    assert_eq!(fork.height(), 6);
    assert!(Arc::ptr_eq(&manager.best_chain(), &fork));

    // the fork took over the trunk file and identity
    assert!(fork.is_trunk());
    assert_eq!(fork.get_id(), params.genesis);
    assert_eq!(fork.forkpoint(), 0);
    assert_eq!(fork.get_hash(1).unwrap(), t1);
    for header in &fork_headers {
        assert_eq!(fork.get_hash(header.block_height).unwrap(), header.block_hash());
    }

    // the old trunk object now holds the losing branch from height 3 up
    assert_eq!(trunk.forkpoint(), 3);
    assert_eq!(trunk.height(), 5);
    assert_eq!(trunk.get_id(), t3);
    assert!(Arc::ptr_eq(&trunk.parent().unwrap(), &fork));
    for header in &trunk_headers[2..] {
        assert_eq!(trunk.get_hash(header.block_height).unwrap(), header.block_hash());
    }

    // the sibling was re-parented onto the new trunk
    assert!(Arc::ptr_eq(&sibling.parent().unwrap(), &fork));
    assert_eq!(sibling.get_hash(1).unwrap(), t1);

    // a fresh bootstrap over the same directory rebuilds the same registry
    let reread = read_blockchains(&config, params.clone()).unwrap();
    assert_eq!(reread.chain_count(), 3);
    let ids = [fork.get_id(), trunk.get_id(), sibling.get_id()];
    for id in &ids {
        assert!(reread.get_chain(id).is_some(), "missing chain {id}");
    }
    assert_eq!(reread.best_chain().get_id(), params.genesis);
    assert_eq!(reread.best_chain().height(), 6);
    let reread_loser = reread.get_chain(&trunk.get_id()).unwrap();
    assert_eq!(reread_loser.forkpoint(), 3);
    assert_eq!(
        reread_loser.parent().unwrap().get_id(),
        params.genesis
    );
    assert_eq!(
        reread.get_chain(&sibling.get_id()).unwrap().parent().unwrap().get_id(),
        params.genesis
    );

    // two fork files remain on disk
    assert_eq!(fs::read_dir(dir.path().join("forks")).unwrap().count(), 2);
}

#[test]
fn checkpointed_chain_lifecycle() {
    let (dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    let headers = extend(&manager, &trunk, 409);
    assert_eq!(trunk.height(), 409);

    // retarget determinism: the same window served from the in-flight
    // context gives the same target as the file store
    let mut context = ChunkHeaders::new();
    assert!(context.is_empty());
    for header in &headers[220..249] {
        context.insert(header.clone());
    }
    assert_eq!(context.min_height(), Some(221));
    assert_eq!(context.max_height(), Some(249));
    assert_eq!(
        trunk.get_target(250, None).unwrap(),
        trunk.get_target(250, Some(&context)).unwrap()
    );

    // compile the first two chunks into checkpoints and boot against them
    let checkpoints = trunk.get_checkpoints().unwrap();
    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].hash, trunk.get_hash(199).unwrap());
    let cp_params = params.clone().with_checkpoints(checkpoints);
    assert_eq!(cp_params.max_checkpoint(), 399);

    let manager = read_blockchains(&config, cp_params.clone()).unwrap();
    let trunk = manager.best_chain();
    // the header above the checkpoint region still connects, so the trunk
    // survives the consistency check
    assert_eq!(trunk.height(), 409);
    assert_eq!(trunk.get_hash(399).unwrap(), cp_params.checkpoints[1].hash);

    // forking inside the checkpoint region is refused
    let rival = competing_header(&trunk, 350, 5);
    assert!(manager.fork(&trunk, &rival).is_err());

    // a fork above the checkpoints works, and a checkpoint-region chunk
    // saved through it lands on the trunk without truncating its tail
    let rival = competing_header(&trunk, 405, 5);
    let fork = manager.fork(&trunk, &rival).unwrap();
    let chunk1: Vec<u8> = headers[199..399]
        .iter()
        .flat_map(Header::serialize)
        .collect();
    fork.save_chunk(&manager, 1, &chunk1).unwrap();
    assert_eq!(trunk.height(), 409);
    assert_eq!(fork.height(), 405);

    // a crafted fork file below the checkpoints is unlinked at bootstrap
    let stale = dir.path().join("forks").join("fork2_100_ab_cd");
    fs::write(&stale, b"junk").unwrap();
    let reread = read_blockchains(&config, cp_params).unwrap();
    assert!(!stale.exists());
    assert_eq!(reread.best_chain().height(), 409);
}

#[test]
fn epoch_transition_floor() {
    let (_dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();

    for height in 265_984..=266_000 {
        assert_eq!(trunk.get_target(height, None).unwrap(), MIN_TARGET);
    }

    // just after the epoch, the moving average resumes from the in-flight
    // window
    let mut context = ChunkHeaders::new();
    let bits = MIN_TARGET.target_to_bits();
    for height in 265_973..=266_000 {
        context.insert(context_header(height, bits));
    }
    let resumed = trunk.get_target(266_001, Some(&context)).unwrap();
    let expected = (MIN_TARGET / 1020u64).overflowing_mul(1020).0;
    assert_eq!(resumed, expected);
}

#[test]
fn lwma_takes_over_at_the_fork_height() {
    let (_dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();

    // a difficulty well below the limit, so neither rule is masked by the
    // MAX_TARGET cap
    let bits = 0x1c07_ffffu32;
    let target = xsg_types::utils::target_from_bits(bits).unwrap();
    let mut context = ChunkHeaders::new();
    for height in 764_910..765_000 {
        context.insert(context_header(height, bits));
    }

    // one height below the activation, the damped moving average rules
    let before = trunk.get_target(764_999, Some(&context)).unwrap();
    assert_eq!(before, (target / 1020u64).overflowing_mul(1020).0);

    // at the activation height, the weighted average takes over: with
    // steady solvetimes the result is the target rounded down to a
    // multiple of k*N
    let after = trunk.get_target(765_000, Some(&context)).unwrap();
    assert_eq!(after, (target / 6_588_000u64).overflowing_mul(6_588_000).0);
    assert_ne!(after, before);
}

#[test]
fn concurrent_readers_during_growth() {
    let (_dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    extend(&manager, &trunk, 5);

    std::thread::scope(|scope| {
        let trunk = &trunk;
        let manager = &manager;
        scope.spawn(move || {
            for _ in 0..100 {
                let _ = trunk.read_header(3);
                let _ = trunk.get_hash(2);
                let _ = trunk.get_target(5, None);
                let _ = manager.best_chain();
            }
        });
        scope.spawn(move || {
            extend(manager, trunk, 5);
        });
    });
    assert_eq!(trunk.height(), 10);
}

#[test]
fn chainwork_accumulates_and_memoizes() {
    let (_dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    extend(&manager, &trunk, 10);

    // early blocks carry compact bits 0x1f07ffff, whose decoded target
    // puts the per-block work at floor(2^32 / 0x7ffff) = 8192
    let per_block = U256::from(8192u64);
    for height in [0i64, 5, 10] {
        let expected = per_block.overflowing_mul(height as u64 + 1).0;
        assert_eq!(manager.get_chainwork(&trunk, height).unwrap(), expected);
    }
    // second query comes from the cache and agrees
    assert_eq!(
        manager.get_chainwork(&trunk, 10).unwrap(),
        manager.get_chainwork(&trunk, 10).unwrap()
    );
    assert_eq!(manager.get_chainwork(&trunk, -1).unwrap(), U256::ZERO);
}

#[test]
fn verify_header_reports_each_check() {
    let (_dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    extend(&manager, &trunk, 2);

    let good = competing_header(&trunk, 3, 0);
    let prev = trunk.get_hash(2).unwrap();
    let target = trunk.get_target(3, None).unwrap();
    assert!(Blockchain::verify_header(&good, &prev, &target, false).is_ok());

    let err = Blockchain::verify_header(&good, &H256::ZERO, &target, false).unwrap_err();
    assert!(err.to_string().contains("prev hash mismatch"), "{err}");

    let mut wrong_bits = good.clone();
    wrong_bits.bits += 1;
    let err = Blockchain::verify_header(&wrong_bits, &prev, &target, false).unwrap_err();
    assert!(err.to_string().contains("bits mismatch"), "{err}");

    // testnet short-circuits everything past linkage
    assert!(Blockchain::verify_header(&wrong_bits, &prev, &target, true).is_ok());
}

#[test]
fn branch_bookkeeping() {
    let (_dir, config, params, genesis) = setup();
    let manager = boot(&config, &params, &genesis);
    let trunk = manager.best_chain();
    extend(&manager, &trunk, 5);

    let rival = competing_header(&trunk, 3, 7);
    let fork = manager.fork(&trunk, &rival).unwrap();

    assert_eq!(trunk.get_max_forkpoint(&manager), 3);
    assert_eq!(trunk.get_branch_size(&manager), 3);
    assert_eq!(fork.get_branch_size(&manager), 1);
    assert!(!trunk.get_name(&manager).is_empty());

    let children = trunk.get_direct_children(&manager);
    assert_eq!(children.len(), 1);
    assert!(Arc::ptr_eq(&children[0], &fork));

    assert_eq!(
        fork.get_height_of_last_common_block_with_chain(&trunk),
        2
    );
    assert_eq!(
        trunk.get_height_of_last_common_block_with_chain(&fork),
        2
    );
}
