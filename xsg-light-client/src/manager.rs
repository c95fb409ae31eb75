//! The registry of competing chains: bootstrap scan, fork creation,
//! chain lookup and the chainwork cache.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, RwLock};

use log::{info, warn};
use xsg_types::network::{NetworkParams, CHUNK_LEN};
use xsg_types::utils::target_from_bits;
use xsg_types::{Header, H256, U256};

use crate::chain::Blockchain;
use crate::config::ClientConfig;
use crate::error::{ChainError, Result};
use crate::LOG_TARGET;

/// The process-wide chain registry. Exactly one registered chain has no
/// parent: the trunk, keyed by the genesis hash.
pub struct ChainManager {
    config: ClientConfig,
    params: Arc<NetworkParams>,
    chains: RwLock<HashMap<H256, Arc<Blockchain>>>,
    // block hash -> cumulative work up to and including that block
    chainwork_cache: RwLock<HashMap<H256, U256>>,
}

/// Rebuilds the chain registry from the headers directory.
///
/// # Errors
///
/// Propagates store failures; individually inconsistent fork files are
/// unlinked rather than reported.
pub fn read_blockchains(config: &ClientConfig, params: NetworkParams) -> Result<ChainManager> {
    ChainManager::read_blockchains(config, params)
}

impl ChainManager {
    /// Rebuilds the registry: instantiate the trunk, sanity-check it above
    /// the last checkpoint, then adopt every consistent fork file and
    /// unlink the rest.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn read_blockchains(config: &ClientConfig, params: NetworkParams) -> Result<Self> {
        let params = Arc::new(params);
        let manager = ChainManager {
            config: config.clone(),
            params: Arc::clone(&params),
            chains: RwLock::new(HashMap::new()),
            chainwork_cache: RwLock::new(HashMap::from([
                // virtual block at height -1
                (H256::ZERO, U256::ZERO),
            ])),
        };

        let forks_dir = config.headers_dir().join("forks");
        fs::create_dir_all(&forks_dir)?;
        let trunk_path = config.headers_dir().join("blockchain_headers");
        if !trunk_path.exists() {
            File::create(&trunk_path)?;
        }

        let trunk = Blockchain::new(
            config.clone(),
            Arc::clone(&params),
            0,
            None,
            params.genesis.clone(),
            H256::ZERO,
        )?;
        manager
            .chains
            .write()
            .expect("chain registry lock poisoned")
            .insert(params.genesis.clone(), Arc::clone(&trunk));

        // the header just above the checkpoint region must still connect
        if trunk.height() > params.max_checkpoint() {
            let connects = match trunk.read_header(params.max_checkpoint() + 1) {
                Ok(Some(header)) => trunk.can_connect(&header, false),
                _ => false,
            };
            if !connects {
                info!(
                    target: LOG_TARGET,
                    "deleting best chain: cannot connect header after last checkpoint"
                );
                fs::remove_file(trunk.path())?;
                File::create(&trunk_path)?;
                trunk.update_size()?;
            }
        }

        // files are named fork2_{forkpoint}_{prev_hash}_{first_hash}, hash
        // fields with leading zeros stripped; parents sort first
        let mut fork_files: Vec<(i64, String)> = Vec::new();
        for entry in fs::read_dir(&forks_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with("fork2_") || name.contains('.') {
                continue;
            }
            match name.split('_').nth(1).and_then(|s| s.parse::<i64>().ok()) {
                Some(forkpoint) => fork_files.push((forkpoint, name)),
                None => warn!(target: LOG_TARGET, "ignoring unparsable fork file {name}"),
            }
        }
        fork_files.sort();

        for (forkpoint, filename) in fork_files {
            manager.instantiate_chain(&forks_dir, forkpoint, &filename)?;
        }

        Ok(manager)
    }

    fn instantiate_chain(&self, forks_dir: &Path, forkpoint: i64, filename: &str) -> Result<()> {
        let delete_chain = |reason: &str| -> Result<()> {
            info!(target: LOG_TARGET, "deleting chain {filename}: {reason}");
            fs::remove_file(forks_dir.join(filename))?;
            Ok(())
        };

        let parts: Vec<&str> = filename.split('_').collect();
        let [_, _, prev_hex, first_hex] = parts.as_slice() else {
            return delete_chain("malformed fork file name");
        };
        // left-pad the stripped hash fields back to 64 hex chars
        let parse_padded = |s: &str| -> Option<H256> { format!("{s:0>64}").parse().ok() };
        let (Some(prev_hash), Some(first_hash)) = (parse_padded(prev_hex), parse_padded(first_hex))
        else {
            return delete_chain("malformed fork file name");
        };

        // forks below the max checkpoint are not allowed
        if forkpoint <= self.params.max_checkpoint() {
            return delete_chain("deleting fork below max checkpoint");
        }

        // sorting by forkpoint guarantees the parent is already registered;
        // candidates are scanned deepest-rooted first so shared prefixes
        // resolve to the same parent on every boot
        let mut candidates = self.chains();
        candidates.sort_by_key(|chain| chain.forkpoint());
        let parent = candidates
            .into_iter()
            .find(|chain| chain.check_hash(forkpoint - 1, &prev_hash));
        let Some(parent) = parent else {
            return delete_chain("cannot find parent for chain");
        };

        let chain = Blockchain::new(
            self.config.clone(),
            Arc::clone(&self.params),
            forkpoint,
            Some(Arc::clone(&parent)),
            first_hash.clone(),
            prev_hash,
        )?;
        let Ok(Some(first_header)) = chain.read_header(forkpoint) else {
            return delete_chain("cannot read first header for chain");
        };
        if first_hash != first_header.block_hash() {
            return delete_chain("incorrect first hash for chain");
        }
        if !parent.can_connect(&first_header, false) {
            return delete_chain("cannot connect chain to parent");
        }
        self.chains
            .write()
            .expect("chain registry lock poisoned")
            .insert(chain.get_id(), chain);
        Ok(())
    }

    #[must_use]
    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// The trunk: the chain registered under the genesis hash.
    #[must_use]
    pub fn best_chain(&self) -> Arc<Blockchain> {
        self.chains
            .read()
            .expect("chain registry lock poisoned")
            .get(&self.params.genesis)
            .cloned()
            .expect("best chain is always registered")
    }

    /// Snapshot of every registered chain.
    #[must_use]
    pub fn chains(&self) -> Vec<Arc<Blockchain>> {
        self.chains
            .read()
            .expect("chain registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains
            .read()
            .expect("chain registry lock poisoned")
            .len()
    }

    #[must_use]
    pub fn get_chain(&self, chain_id: &H256) -> Option<Arc<Blockchain>> {
        self.chains
            .read()
            .expect("chain registry lock poisoned")
            .get(chain_id)
            .cloned()
    }

    /// The first registered chain that already contains this header.
    #[must_use]
    pub fn check_header(&self, header: &Header) -> Option<Arc<Blockchain>> {
        self.chains()
            .into_iter()
            .find(|chain| chain.check_header(header))
    }

    /// The first registered chain this header would extend at its tip.
    #[must_use]
    pub fn can_connect(&self, header: &Header) -> Option<Arc<Blockchain>> {
        self.chains()
            .into_iter()
            .find(|chain| chain.can_connect(header, true))
    }

    /// Starts a new branch from an accepted header that does not extend any
    /// chain tip, and registers it.
    ///
    /// # Errors
    ///
    /// `InvalidHeader` when the header does not connect to the parent, or
    /// when the fork would start at or below the last checkpoint.
    pub fn fork(&self, parent: &Arc<Blockchain>, header: &Header) -> Result<Arc<Blockchain>> {
        if !parent.can_connect(header, false) {
            return Err(ChainError::InvalidHeader(
                "forking header does not connect to parent chain".to_string(),
            ));
        }
        let forkpoint = header.block_height;
        let prev_hash = parent.get_hash(forkpoint - 1)?;
        let chain = Blockchain::new(
            self.config.clone(),
            Arc::clone(&self.params),
            forkpoint,
            Some(Arc::clone(parent)),
            header.block_hash(),
            prev_hash,
        )?;
        info!(
            target: LOG_TARGET,
            "forking chain at height {forkpoint}: {}", chain.get_id()
        );
        File::create(chain.path())?;
        chain.save_header(self, header)?;
        // save_header may already have registered us through a swap; in
        // that case this re-inserts the same value under the same id
        self.chains
            .write()
            .expect("chain registry lock poisoned")
            .insert(chain.get_id(), Arc::clone(&chain));
        Ok(chain)
    }

    /// Cumulative work up to and including the block at `height`, memoized
    /// per block hash at chunk boundaries.
    ///
    /// # Errors
    ///
    /// `MissingHeader` when a header on the way down is absent.
    pub fn get_chainwork(&self, chain: &Arc<Blockchain>, height: i64) -> Result<U256> {
        let mut uncached: Vec<(i64, H256)> = Vec::new();
        let mut cursor = height;
        let mut work = loop {
            let hash = chain.get_hash(cursor)?;
            let cached = self
                .chainwork_cache
                .read()
                .expect("chainwork cache lock poisoned")
                .get(&hash)
                .copied();
            if let Some(cached) = cached {
                break cached;
            }
            uncached.push((cursor, hash));
            cursor -= 1;
        };

        for (h, hash) in uncached.into_iter().rev() {
            let header = chain.read_header(h)?.ok_or(ChainError::MissingHeader(h))?;
            let block_work = target_from_bits(header.bits)?.inverse();
            let (sum, overflow) = work.overflowing_add(block_work);
            if overflow {
                return Err(ChainError::InvalidHeader(
                    "chainwork overflowed".to_string(),
                ));
            }
            work = sum;
            if (h + 1) % CHUNK_LEN == 0 || h == height {
                self.chainwork_cache
                    .write()
                    .expect("chainwork cache lock poisoned")
                    .insert(hash, work);
            }
        }
        Ok(work)
    }

    /// Atomically re-keys a child/parent pair after a swap. Called with
    /// both per-chain locks held; the registry lock always comes last.
    pub(crate) fn reregister_swapped(
        &self,
        child_old_id: &H256,
        parent_old_id: &H256,
        child: (H256, Arc<Blockchain>),
        parent: (H256, Arc<Blockchain>),
    ) {
        let mut chains = self.chains.write().expect("chain registry lock poisoned");
        chains.remove(child_old_id);
        chains.remove(parent_old_id);
        chains.insert(child.0, child.1);
        chains.insert(parent.0, parent.1);
    }
}
