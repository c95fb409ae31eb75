//! A single branch of headers backed by an append-only file, plus the
//! file-swap reorg that promotes a fork over its parent.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use xsg_types::hash::double_sha256;
use xsg_types::header::{header_size, Header, HDR_LEN, HDR_LEN_FORK};
use xsg_types::network::{
    NetworkParams, Target, CHUNK_LEN, EH_EPOCH_1_END, EQUIHASH_FORK_HEIGHT, LWMA_FORK_BLOCK,
    MAX_TARGET, MIN_TARGET, POW_AVERAGING_WINDOW,
};
use xsg_types::{Checkpoint, H256, U256};

use crate::config::ClientConfig;
use crate::error::{ChainError, Result};
use crate::manager::ChainManager;
use crate::retarget::{self, ChunkHeaders};
use crate::LOG_TARGET;

/// Cumulative serialized bytes of all headers below `height`.
fn stored_bytes_below(height: i64) -> i64 {
    let height = height.max(0);
    let pre = height.min(EQUIHASH_FORK_HEIGHT);
    let post = (height - EQUIHASH_FORK_HEIGHT).max(0);
    pre * HDR_LEN as i64 + post * HDR_LEN_FORK as i64
}

/// Byte position of the header at `height` in a file whose first record sits
/// at `checkpoint`. Negative when `height` lies below the file's first
/// record.
pub(crate) fn byte_offset(checkpoint: i64, height: i64) -> i64 {
    stored_bytes_below(height) - stored_bytes_below(checkpoint)
}

/// Inverts `byte_offset`: the number of whole header records in a file of
/// `len` bytes whose first record sits at `forkpoint`.
pub(crate) fn records_in(forkpoint: i64, len: u64) -> i64 {
    let mut remaining = len as i64;
    let pre_slots = (EQUIHASH_FORK_HEIGHT - forkpoint).max(0);
    let pre = (remaining / HDR_LEN as i64).min(pre_slots);
    remaining -= pre * HDR_LEN as i64;
    pre + remaining / HDR_LEN_FORK as i64
}

struct ChainInner {
    /// Height of the first header owned by this chain; 0 for the trunk.
    forkpoint: i64,
    parent: Option<Arc<Blockchain>>,
    /// Hash of the header at `forkpoint`; doubles as the chain id.
    forkpoint_hash: H256,
    /// Hash at `forkpoint - 1`; the all-zero hash for the trunk.
    prev_hash: H256,
    /// Cached number of headers owned by this chain.
    size: i64,
}

/// One linear branch of headers. Queries below `forkpoint` recurse to the
/// parent chain; everything else is answered from this chain's file.
pub struct Blockchain {
    config: ClientConfig,
    params: Arc<NetworkParams>,
    inner: Mutex<ChainInner>,
}

impl Blockchain {
    pub(crate) fn new(
        config: ClientConfig,
        params: Arc<NetworkParams>,
        forkpoint: i64,
        parent: Option<Arc<Blockchain>>,
        forkpoint_hash: H256,
        prev_hash: H256,
    ) -> Result<Arc<Self>> {
        if forkpoint > 0 && forkpoint <= params.max_checkpoint() {
            return Err(ChainError::InvalidHeader(format!(
                "cannot fork below max checkpoint, forkpoint: {forkpoint}"
            )));
        }
        let chain = Arc::new(Blockchain {
            config,
            params,
            inner: Mutex::new(ChainInner {
                forkpoint,
                parent,
                forkpoint_hash,
                prev_hash,
                size: 0,
            }),
        });
        chain.update_size()?;
        Ok(chain)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().expect("chain lock poisoned")
    }

    fn path_locked(&self, inner: &ChainInner) -> PathBuf {
        let dir = self.config.headers_dir();
        match inner.parent {
            None => dir.join("blockchain_headers"),
            Some(_) => {
                let prev = inner.prev_hash.to_string();
                let first = inner.forkpoint_hash.to_string();
                let basename = format!(
                    "fork2_{}_{}_{}",
                    inner.forkpoint,
                    prev.trim_start_matches('0'),
                    first.trim_start_matches('0'),
                );
                dir.join("forks").join(basename)
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        let inner = self.lock();
        self.path_locked(&inner)
    }

    /// The chain id: the hash of its first header.
    #[must_use]
    pub fn get_id(&self) -> H256 {
        self.lock().forkpoint_hash.clone()
    }

    #[must_use]
    pub fn forkpoint(&self) -> i64 {
        self.lock().forkpoint
    }

    #[must_use]
    pub fn prev_hash(&self) -> H256 {
        self.lock().prev_hash.clone()
    }

    #[must_use]
    pub fn parent(&self) -> Option<Arc<Blockchain>> {
        self.lock().parent.clone()
    }

    #[must_use]
    pub fn is_trunk(&self) -> bool {
        self.lock().parent.is_none()
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.lock().size
    }

    /// Height of the chain tip; `forkpoint - 1` while the chain is empty.
    #[must_use]
    pub fn height(&self) -> i64 {
        let inner = self.lock();
        inner.forkpoint + inner.size - 1
    }

    /// Re-derives the cached header count from the file length.
    pub(crate) fn update_size(&self) -> Result<()> {
        let mut inner = self.lock();
        let path = self.path_locked(&inner);
        inner.size = match fs::metadata(&path) {
            Ok(meta) => records_in(inner.forkpoint, meta.len()),
            Err(_) => 0,
        };
        Ok(())
    }

    fn ensure_file_available(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        let dir = self.config.headers_dir();
        if dir.exists() {
            Err(ChainError::HeadersFileNotFound(path.to_path_buf()))
        } else {
            Err(ChainError::HeadersDirNotFound(dir.to_path_buf()))
        }
    }

    fn write_locked(
        &self,
        inner: &mut ChainInner,
        data: &[u8],
        offset: i64,
        truncate: bool,
    ) -> Result<()> {
        let path = self.path_locked(inner);
        self.ensure_file_available(&path)?;
        let tip_offset = byte_offset(inner.forkpoint, inner.forkpoint + inner.size - 1);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if truncate && offset != tip_offset {
            file.set_len(offset.max(0) as u64)?;
        }
        file.seek(SeekFrom::Start(offset.max(0) as u64))?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()?;
        inner.size = records_in(inner.forkpoint, file.metadata()?.len());
        Ok(())
    }

    /// Reads the header at `height`, delegating below the forkpoint and
    /// answering `None` above the tip or for an all-zero (unfilled) slot.
    ///
    /// # Errors
    ///
    /// I/O failures and a vanished headers file surface as errors.
    pub fn read_header(&self, height: i64) -> Result<Option<Header>> {
        if height < 0 {
            return Ok(None);
        }
        let (forkpoint, parent, size, path) = {
            let inner = self.lock();
            (
                inner.forkpoint,
                inner.parent.clone(),
                inner.size,
                self.path_locked(&inner),
            )
        };
        if height < forkpoint {
            return match parent {
                Some(parent) => parent.read_header(height),
                None => Ok(None),
            };
        }
        if height > forkpoint + size - 1 {
            return Ok(None);
        }
        self.ensure_file_available(&path)?;
        let record_size = header_size(height);
        let mut raw = vec![0u8; record_size];
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(byte_offset(forkpoint, height) as u64))?;
        file.read_exact(&mut raw).map_err(|e| {
            ChainError::InvalidHeader(format!("expected to read a full header at {height}: {e}"))
        })?;
        if raw.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(Header::deserialize(&raw, height)?))
    }

    /// Latest header of this chain.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn header_at_tip(&self) -> Result<Option<Header>> {
        self.read_header(self.height())
    }

    /// The block hash at `height`: the zero sentinel at -1, the genesis
    /// hash at 0, the compiled-in hash at checkpointed chunk boundaries,
    /// otherwise the hash of the stored header.
    ///
    /// # Errors
    ///
    /// `MissingHeader` when the store has no header at `height`.
    pub fn get_hash(&self, height: i64) -> Result<H256> {
        if height == -1 {
            return Ok(H256::ZERO);
        }
        if height == 0 {
            return Ok(self.params.genesis.clone());
        }
        let within_checkpoints = height <= self.params.max_checkpoint();
        if within_checkpoints && (height + 1) % CHUNK_LEN == 0 {
            let index = (height / CHUNK_LEN) as usize;
            return Ok(self.params.checkpoints[index].hash.clone());
        }
        match self.read_header(height)? {
            Some(header) => Ok(header.block_hash()),
            None => Err(ChainError::MissingHeader(height)),
        }
    }

    /// Whether the block at `height` has the given hash.
    #[must_use]
    pub fn check_hash(&self, height: i64, hash: &H256) -> bool {
        matches!(self.get_hash(height), Ok(h) if h == *hash)
    }

    /// Whether this chain contains the given header.
    #[must_use]
    pub fn check_header(&self, header: &Header) -> bool {
        self.check_hash(header.block_height, &header.block_hash())
    }

    /// The expected target at `height`, serving header lookups from the
    /// in-flight chunk context first and the store second.
    ///
    /// # Errors
    ///
    /// `MissingHeader` when a header the retarget window needs is in
    /// neither place.
    pub fn get_target(&self, height: i64, chunk: Option<&ChunkHeaders>) -> Result<Target> {
        if height <= POW_AVERAGING_WINDOW {
            return Ok(MAX_TARGET);
        }
        // The final averaging window of the first Equihash epoch is pinned
        // to the floor.
        if height > EH_EPOCH_1_END - POW_AVERAGING_WINDOW && height <= EH_EPOCH_1_END {
            return Ok(MIN_TARGET);
        }
        let lookup = |h: i64| -> Result<Header> {
            if let Some(headers) = chunk {
                if let Some(header) = headers.get(h) {
                    return Ok(header.clone());
                }
            }
            self.read_header(h)?.ok_or(ChainError::MissingHeader(h))
        };
        if height >= LWMA_FORK_BLOCK {
            retarget::lwma3_target(&lookup, height)
        } else {
            retarget::digishield_target(&lookup, height)
        }
    }

    /// Checks a single header against its expected predecessor and target.
    ///
    /// # Errors
    ///
    /// `InvalidHeader` describing the first failed check.
    pub fn verify_header(
        header: &Header,
        prev_hash: &H256,
        target: &Target,
        testnet: bool,
    ) -> Result<()> {
        if *prev_hash != header.prev_block_hash {
            return Err(ChainError::InvalidHeader(format!(
                "prev hash mismatch: {} vs {}",
                prev_hash, header.prev_block_hash
            )));
        }
        if testnet {
            return Ok(());
        }
        let bits = target.target_to_bits();
        if bits != header.bits {
            return Err(ChainError::InvalidHeader(format!(
                "bits mismatch: {} vs {}",
                bits, header.bits
            )));
        }
        let hash = header.block_hash();
        if U256::from_le_bytes(&hash.0) > *target {
            return Err(ChainError::InvalidHeader(format!(
                "insufficient proof of work: {hash} vs target {target:?}"
            )));
        }
        Ok(())
    }

    /// Verifies a whole chunk of headers against linkage, expected targets
    /// and proof of work, feeding each accepted header into the in-flight
    /// context so the target function can see it.
    ///
    /// # Errors
    ///
    /// The first failure aborts the whole chunk.
    pub fn verify_chunk(&self, index: i64, data: &[u8]) -> Result<()> {
        let mut height = index * CHUNK_LEN;
        let mut prev_hash = self.get_hash(height - 1)?;
        let mut chunk_headers = ChunkHeaders::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let record_size = header_size(height);
            if offset + record_size > data.len() {
                return Err(ChainError::InvalidHeader(format!(
                    "truncated chunk record at height {height}"
                )));
            }
            let header = Header::deserialize(&data[offset..offset + record_size], height)?;
            let target = self.get_target(height, Some(&chunk_headers))?;
            Self::verify_header(&header, &prev_hash, &target, self.params.testnet)?;
            prev_hash = header.block_hash();
            chunk_headers.insert(header);
            offset += record_size;
            height += 1;
        }
        Ok(())
    }

    /// Appends a single verified header at the chain tip, then re-evaluates
    /// the chain against its parent.
    ///
    /// # Errors
    ///
    /// `InvalidHeader` when the header does not extend the tip or has the
    /// wrong serialized size.
    pub fn save_header(self: &Arc<Self>, manager: &ChainManager, header: &Header) -> Result<()> {
        let height = header.block_height;
        let data = header.serialize();
        {
            let mut inner = self.lock();
            if height - inner.forkpoint != inner.size {
                return Err(ChainError::InvalidHeader(format!(
                    "header at height {height} does not extend the chain tip"
                )));
            }
            if data.len() != header_size(height) {
                return Err(ChainError::InvalidHeader(format!(
                    "bad serialized header length: {}",
                    data.len()
                )));
            }
            let offset = byte_offset(inner.forkpoint, height);
            self.write_locked(&mut inner, &data, offset, true)?;
        }
        self.swap_with_parent(manager)
    }

    /// Writes a verified chunk into the store. Chunks inside the checkpoint
    /// region belong to the trunk; a chunk straddling this chain's
    /// forkpoint sheds the prefix owned by the parent.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn save_chunk(self: &Arc<Self>, manager: &ChainManager, index: i64, chunk: &[u8]) -> Result<()> {
        if index < 0 {
            return Err(ChainError::InvalidHeader(format!(
                "negative chunk index: {index}"
            )));
        }
        let within_checkpoints = index < self.params.checkpoints.len() as i64;
        if within_checkpoints && !self.is_trunk() {
            // chunks in the checkpoint region are the trunk's responsibility
            return manager.best_chain().save_chunk(manager, index, chunk);
        }
        {
            let mut inner = self.lock();
            let mut data = chunk;
            let mut delta_bytes = byte_offset(inner.forkpoint, index * CHUNK_LEN);
            if delta_bytes < 0 {
                let skip = (-delta_bytes) as usize;
                if skip >= chunk.len() {
                    return Err(ChainError::InvalidHeader(
                        "chunk lies entirely below the forkpoint".to_string(),
                    ));
                }
                data = &chunk[skip..];
                delta_bytes = 0;
            }
            self.write_locked(&mut inner, data, delta_bytes, !within_checkpoints)?;
        }
        self.swap_with_parent(manager)
    }

    /// Decodes, verifies and saves one hex-encoded chunk. Any failure is
    /// logged and reported as `false` so the network layer can penalize the
    /// peer without unwinding.
    pub fn connect_chunk(self: &Arc<Self>, manager: &ChainManager, index: i64, hexdata: &str) -> bool {
        let result = (|| -> Result<()> {
            let data = hex::decode(hexdata)
                .map_err(|e| ChainError::InvalidHeader(format!("bad chunk hex: {e}")))?;
            self.verify_chunk(index, &data)?;
            self.save_chunk(manager, index, &data)
        })();
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(target: LOG_TARGET, "rejecting chunk {index}: {e}");
                false
            }
        }
    }

    /// Whether `header` extends this chain: at the tip when `check_height`
    /// is set, with matching linkage, target and proof of work. A missing
    /// retarget window means "no" rather than an error.
    #[must_use]
    pub fn can_connect(&self, header: &Header, check_height: bool) -> bool {
        let height = header.block_height;
        if check_height && self.height() != height - 1 {
            return false;
        }
        if height == 0 {
            return header.block_hash() == self.params.genesis;
        }
        let prev_hash = match self.get_hash(height - 1) {
            Ok(hash) => hash,
            Err(_) => return false,
        };
        if prev_hash != header.prev_block_hash {
            return false;
        }
        let target = match self.get_target(height, None) {
            Ok(target) => target,
            Err(_) => return false,
        };
        Self::verify_header(header, &prev_hash, &target, self.params.testnet).is_ok()
    }

    /// One `(hash, target)` entry per full chunk of this chain: the hash of
    /// the chunk's last block and the target in force just after it.
    ///
    /// # Errors
    ///
    /// `MissingHeader` when the chain is shorter than its header count
    /// claims.
    pub fn get_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let chunks = self.height() / CHUNK_LEN;
        for index in 0..chunks {
            checkpoints.push(Checkpoint {
                hash: self.get_hash((index + 1) * CHUNK_LEN - 1)?,
                target: self.get_target((index + 1) * CHUNK_LEN, None)?,
            });
        }
        Ok(checkpoints)
    }

    /// Chains whose parent pointer refers to this chain. Children carry the
    /// only reference; parents discover them by scanning the registry.
    #[must_use]
    pub fn get_direct_children(self: &Arc<Self>, manager: &ChainManager) -> Vec<Arc<Blockchain>> {
        manager
            .chains()
            .into_iter()
            .filter(|chain| {
                let inner = chain.lock();
                matches!(&inner.parent, Some(parent) if Arc::ptr_eq(parent, self))
            })
            .collect()
    }

    fn get_max_child(self: &Arc<Self>, manager: &ChainManager) -> Option<i64> {
        self.get_direct_children(manager)
            .iter()
            .map(|child| child.forkpoint())
            .max()
    }

    /// The max height where there is a fork related to this chain.
    #[must_use]
    pub fn get_max_forkpoint(self: &Arc<Self>, manager: &ChainManager) -> i64 {
        self.get_max_child(manager).unwrap_or_else(|| self.forkpoint())
    }

    /// Number of headers above the last fork related to this chain.
    #[must_use]
    pub fn get_branch_size(self: &Arc<Self>, manager: &ChainManager) -> i64 {
        self.height() - self.get_max_forkpoint(manager) + 1
    }

    /// Short human-readable label for this branch.
    #[must_use]
    pub fn get_name(self: &Arc<Self>, manager: &ChainManager) -> String {
        self.get_hash(self.get_max_forkpoint(manager))
            .map(|hash| {
                hash.to_string()
                    .trim_start_matches('0')
                    .chars()
                    .take(10)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Map from each chain on the path to the trunk to the height of its
    /// last block shared with this chain.
    #[must_use]
    pub fn get_parent_heights(self: &Arc<Self>) -> Vec<(Arc<Blockchain>, i64)> {
        let mut result = vec![(Arc::clone(self), self.height())];
        let mut chain = Arc::clone(self);
        loop {
            let (parent, forkpoint) = {
                let inner = chain.lock();
                (inner.parent.clone(), inner.forkpoint)
            };
            match parent {
                None => break,
                Some(parent) => {
                    result.push((Arc::clone(&parent), forkpoint - 1));
                    chain = parent;
                }
            }
        }
        result
    }

    /// Height of the highest block shared with `other`.
    #[must_use]
    pub fn get_height_of_last_common_block_with_chain(
        self: &Arc<Self>,
        other: &Arc<Blockchain>,
    ) -> i64 {
        let ours = self.get_parent_heights();
        let theirs = other.get_parent_heights();
        let mut last_common = 0;
        for (chain, our_height) in &ours {
            if let Some((_, their_height)) = theirs
                .iter()
                .find(|(candidate, _)| Arc::ptr_eq(candidate, chain))
            {
                last_common = last_common.max((*our_height).min(*their_height));
            }
        }
        last_common
    }

    /// Repeatedly exchanges this chain with its parent while it carries the
    /// higher tip, re-parenting former siblings that now connect to us.
    ///
    /// # Errors
    ///
    /// `SwapCycle` when the loop fails to make progress.
    pub fn swap_with_parent(self: &Arc<Self>, manager: &ChainManager) -> Result<()> {
        let mut swaps = 0usize;
        loop {
            let old_parent = self.parent();
            if !self.swap_with_parent_once(manager)? {
                break;
            }
            swaps += 1;
            if swaps > manager.chain_count() {
                return Err(ChainError::SwapCycle(swaps));
            }
            // we might have become the parent of some of our former siblings
            if let Some(old_parent) = &old_parent {
                for sibling in old_parent.get_direct_children(manager) {
                    let (sibling_forkpoint, sibling_prev_hash) = {
                        let inner = sibling.lock();
                        (inner.forkpoint, inner.prev_hash.clone())
                    };
                    if self.check_hash(sibling_forkpoint - 1, &sibling_prev_hash) {
                        sibling.lock().parent = Some(Arc::clone(self));
                    }
                }
            }
        }
        Ok(())
    }

    /// Performs one file-and-metadata exchange with the parent if this
    /// chain's tip is higher. The two `Blockchain` values keep containing
    /// the same headers, but their ids change and so they move to different
    /// files.
    fn swap_with_parent_once(self: &Arc<Self>, manager: &ChainManager) -> Result<bool> {
        let Some(parent) = self.parent() else {
            return Ok(false);
        };
        if self.height() <= parent.height() {
            return Ok(false);
        }

        // lock order: child first, then parent, then the registry
        let mut child = self.lock();
        let mut par = parent.lock();
        match &child.parent {
            Some(current) if Arc::ptr_eq(current, &parent) => {}
            _ => return Ok(false),
        }
        if child.forkpoint + child.size <= par.forkpoint + par.size {
            return Ok(false);
        }

        info!(
            target: LOG_TARGET,
            "swapping {} {}", child.forkpoint, par.forkpoint
        );
        let child_old_id = child.forkpoint_hash.clone();
        let parent_old_id = par.forkpoint_hash.clone();
        let child_old_path = self.path_locked(&child);
        let parent_old_path = parent.path_locked(&par);
        self.ensure_file_available(&child_old_path)?;
        self.ensure_file_available(&parent_old_path)?;

        let child_data = fs::read(&child_old_path)?;
        debug_assert!(child.forkpoint > par.forkpoint);
        let offset = byte_offset(par.forkpoint, child.forkpoint);
        let parent_tail = {
            let mut file = File::open(&parent_old_path)?;
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut tail = Vec::new();
            file.read_to_end(&mut tail)?;
            tail
        };
        let first_record_len = header_size(child.forkpoint);
        if parent_tail.len() < first_record_len {
            return Err(ChainError::InvalidHeader(format!(
                "parent chain has no header at forkpoint {}",
                child.forkpoint
            )));
        }

        // the child's file takes the parent's tail, the parent's file takes
        // the child's records at the same offset
        write_file_at(&child_old_path, &parent_tail, 0, true)?;
        write_file_at(&parent_old_path, &child_data, offset as u64, true)?;

        // exchange the metadata; the child inherits the parent's identity
        // and the parent becomes a fork rooted at the child's old forkpoint
        child.parent = par.parent.take();
        par.parent = Some(Arc::clone(self));
        mem::swap(&mut child.forkpoint, &mut par.forkpoint);
        mem::swap(&mut child.prev_hash, &mut par.prev_hash);
        child.forkpoint_hash = parent_old_id.clone();
        par.forkpoint_hash = double_sha256(&parent_tail[..first_record_len]);

        // the former child file now carries the parent's records: give it
        // the parent's new fork name
        fs::rename(&child_old_path, parent.path_locked(&par))?;

        child.size = records_in(child.forkpoint, file_len(&self.path_locked(&child))?);
        par.size = records_in(par.forkpoint, file_len(&parent.path_locked(&par))?);

        manager.reregister_swapped(
            &child_old_id,
            &parent_old_id,
            (child.forkpoint_hash.clone(), Arc::clone(self)),
            (par.forkpoint_hash.clone(), Arc::clone(&parent)),
        );
        Ok(true)
    }
}

fn file_len(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.len())
}

fn write_file_at(path: &Path, data: &[u8], offset: u64, truncate: bool) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    if truncate {
        file.set_len(offset)?;
    }
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}
