//! Ordered collection of message blocks.
//!
//! The registry owns every block of a store, sorted by first sequence, and
//! routes operations to the block covering a given sequence. The newest
//! block is the active one: the sole target of appends until it fills, at
//! which point it seals and a successor is created. Blocks emptied by
//! removals are unlinked, except the active block.

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use silo_types::{BlockId, Sequence};
use tracing::debug;

use crate::block::MsgBlock;
use crate::Result;

pub(crate) struct BlockRegistry {
    msg_dir: PathBuf,
    block_size: u64,
    /// Ordered by `first_seq`; never empty.
    blocks: Vec<MsgBlock>,
    next_block_id: BlockId,
}

impl BlockRegistry {
    /// Creates a registry with a single fresh block.
    pub fn create(msg_dir: &Path, block_size: u64, first_seq: Sequence) -> Result<Self> {
        let id = BlockId::new(1);
        let block = MsgBlock::create(msg_dir, id, first_seq, block_size)?;

        Ok(Self {
            msg_dir: msg_dir.to_path_buf(),
            block_size,
            blocks: vec![block],
            next_block_id: id.next(),
        })
    }

    /// Recovers a registry from the block files in `msg_dir`. Returns `None`
    /// when the directory holds no blocks.
    pub fn recover(msg_dir: &Path, block_size: u64) -> Result<Option<Self>> {
        let mut ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(msg_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".blk") {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.push(id);
                }
            }
        }

        if ids.is_empty() {
            return Ok(None);
        }
        ids.sort_unstable();
        let next_block_id = BlockId::new(ids[ids.len() - 1]).next();

        let mut blocks = Vec::with_capacity(ids.len());
        for id in &ids {
            blocks.push(MsgBlock::recover(msg_dir, BlockId::new(*id), block_size)?);
        }

        // A block scanned as empty with no sidecar cannot know its range;
        // pin it just past its predecessor.
        let mut running_last = Sequence::ZERO;
        for block in &mut blocks {
            if block.first_seq() == Sequence::ZERO {
                block.reset_range(running_last.next());
            }
            if block.last_seq() > running_last {
                running_last = block.last_seq();
            }
        }

        // Blocks emptied by removals would have been unlinked while running;
        // finish the job now. The newest block always stays.
        let mut i = 0;
        while i + 1 < blocks.len() {
            if blocks[i].is_live_empty() {
                let block = blocks.remove(i);
                debug!(block = %block.id(), "dropping empty block recovered from disk");
                block.delete_files()?;
            } else {
                i += 1;
            }
        }

        Ok(Some(Self {
            msg_dir: msg_dir.to_path_buf(),
            block_size,
            blocks,
            next_block_id,
        }))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[MsgBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut MsgBlock> {
        self.blocks.iter_mut()
    }

    /// The active (newest) block.
    pub fn active(&self) -> &MsgBlock {
        self.blocks.last().expect("registry always holds a block")
    }

    fn active_mut(&mut self) -> &mut MsgBlock {
        self.blocks.last_mut().expect("registry always holds a block")
    }

    /// Largest sequence ever written (or reserved) across all blocks.
    pub fn last_seq(&self) -> Sequence {
        self.active().last_seq()
    }

    /// Smallest live sequence across all blocks.
    pub fn first_live_seq(&self) -> Option<Sequence> {
        self.blocks.iter().find_map(MsgBlock::min_live_seq)
    }

    /// The block covering `seq`, if any.
    pub fn locate(&self, seq: Sequence) -> Option<&MsgBlock> {
        self.locate_idx(seq).map(|i| &self.blocks[i])
    }

    fn locate_idx(&self, seq: Sequence) -> Option<usize> {
        let i = self.blocks.partition_point(|b| b.first_seq() <= seq);
        if i == 0 {
            return None;
        }
        self.blocks[i - 1].covers(seq).then_some(i - 1)
    }

    /// Appends a record to the active block, rolling over to a fresh block
    /// when the active one is full.
    pub fn append(
        &mut self,
        seq: Sequence,
        timestamp_ns: i64,
        subject: &str,
        payload: &[u8],
    ) -> Result<()> {
        if self
            .active_mut()
            .try_append(seq, timestamp_ns, subject, payload)?
            .is_some()
        {
            return Ok(());
        }

        // Active block is full: seal it, persist its index, start a successor
        // whose range begins at this record.
        self.active_mut().seal()?;
        self.active_mut().sync()?;
        self.active_mut().persist_snapshot()?;

        let id = self.next_block_id;
        debug!(block = %id, first_seq = %seq, "rolling over to new message block");
        let block = MsgBlock::create(&self.msg_dir, id, seq, self.block_size)?;
        self.next_block_id = id.next();
        self.blocks.push(block);

        self.active_mut()
            .try_append(seq, timestamp_ns, subject, payload)?
            .expect("fresh block accepts any record size");

        Ok(())
    }

    /// Removes a live sequence, reclaiming the block if that emptied it.
    /// Returns the framed size of the removed record.
    pub fn remove(&mut self, seq: Sequence) -> Result<Option<u32>> {
        let Some(i) = self.locate_idx(seq) else {
            return Ok(None);
        };
        let Some(size) = self.blocks[i].remove(seq) else {
            return Ok(None);
        };
        self.commit_removal(i)?;
        Ok(Some(size))
    }

    /// Erases a live sequence in place, reclaiming the block if emptied.
    pub fn erase(&mut self, seq: Sequence, rng: &mut impl Rng) -> Result<Option<u32>> {
        let Some(i) = self.locate_idx(seq) else {
            return Ok(None);
        };
        let Some(size) = self.blocks[i].erase(seq, rng)? else {
            return Ok(None);
        };
        self.commit_removal(i)?;
        Ok(Some(size))
    }

    /// Deletes every block and starts a single fresh one whose range begins
    /// at `first_seq`.
    pub fn purge(&mut self, first_seq: Sequence) -> Result<()> {
        for block in &self.blocks {
            block.delete_files()?;
        }
        self.blocks.clear();

        let id = self.next_block_id;
        let block = MsgBlock::create(&self.msg_dir, id, first_seq, self.block_size)?;
        self.next_block_id = id.next();
        self.blocks.push(block);

        Ok(())
    }

    /// Makes a removal durable: either reclaims the emptied block or
    /// rewrites the surviving block's sidecar. Without the rewrite, a crash
    /// after the removal would recover the stale sidecar and silently
    /// resurrect the removed sequence.
    fn commit_removal(&mut self, i: usize) -> Result<()> {
        if i + 1 != self.blocks.len() && self.blocks[i].is_live_empty() {
            let block = self.blocks.remove(i);
            debug!(block = %block.id(), "reclaiming emptied message block");
            block.delete_files()?;
            return Ok(());
        }

        let block = &mut self.blocks[i];
        block.flush()?;
        block.persist_snapshot()
    }
}
