//! Block delta planner — the minimal set of repository reads that
//! reconstructs a block-incremental file.
//!
//! Inputs: the file's block map from the latest backup, and an optional
//! *delta map* — the checksum list of the target file as it already exists on
//! the restore host.  Blocks whose local checksum matches are skipped; the
//! rest are grouped by `(reference, contiguous offset)` so each repository
//! object opens at most once per contiguous run, and references are visited
//! newest-first — later backups tend to hold most of the needed blocks, which
//! keeps open counts low on older archives.
//!
//! [`DeltaReader`] executes the plan as a pull API: one [`DeltaWrite`] per
//! call, opening a chunked + filtered read per super-block and discarding
//! blocks the plan does not want.  Every wanted block's checksum is verified
//! against the plan before it is handed out.

use std::collections::BTreeMap;

use log::debug;
use sha1::{Digest, Sha1};

use crate::blockmap::BlockMap;
use crate::chunked::ChunkedRead;
use crate::error::{Error, Result};
use crate::filter::FilterPipeline;
use crate::manifest::Label;
use crate::storage::Storage;
use crate::varint;

/// Truncated SHA-1 identifying one block's plaintext.
pub fn block_checksum(data: &[u8], checksum_size: usize) -> Vec<u8> {
    let digest = Sha1::digest(data);
    digest[..checksum_size.min(digest.len())].to_vec()
}

// ── Plan model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanBlock {
    /// Ordinal within the super-block.
    pub block_no:      u64,
    /// Destination offset in the reconstructed file.
    pub target_offset: u64,
    pub checksum:      Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSuperBlock {
    /// Stored (compressed/encrypted, chunk-framed) size.
    pub size:   u64,
    pub blocks: Vec<PlanBlock>,
}

/// One contiguous ranged read of a repository object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRead {
    pub reference:    u32,
    pub bundle_id:    u64,
    pub offset:       u64,
    /// Total extent: the sum of the super-block sizes.
    pub size:         u64,
    pub super_blocks: Vec<PlanSuperBlock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaPlan {
    pub reads: Vec<PlanRead>,
}

impl DeltaPlan {
    /// Build the read plan.  `delta_map[i]` is the local checksum of file
    /// block `i`; pass `&[]` to restore from scratch.
    pub fn build(map: &BlockMap, delta_map: &[Vec<u8>], block_size: u64) -> DeltaPlan {
        // Wanted block indices per reference.
        let mut by_reference: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (idx, item) in map.iter().enumerate() {
            let unchanged = delta_map.get(idx).is_some_and(|c| *c == item.checksum);
            if !unchanged {
                by_reference.entry(item.reference).or_default().push(idx);
            }
        }

        let mut plan = DeltaPlan::default();

        // Newest references first.
        for (&reference, indices) in by_reference.iter().rev() {
            for &idx in indices {
                let item = &map.items[idx];
                let block = PlanBlock {
                    block_no:      item.block,
                    target_offset: idx as u64 * block_size,
                    checksum:      item.checksum.clone(),
                };

                let current = plan.reads.last_mut().filter(|r| {
                    r.reference == reference
                        && r.bundle_id == item.bundle_id
                        && (last_offset(r) == item.offset
                            || last_offset(r) + last_size(r) == item.offset)
                });

                match current {
                    Some(read) => {
                        if last_offset(read) == item.offset {
                            // Same super-block.
                            read.super_blocks.last_mut().unwrap().blocks.push(block);
                        } else {
                            read.super_blocks
                                .push(PlanSuperBlock { size: item.size, blocks: vec![block] });
                            read.size += item.size;
                        }
                    }
                    None => plan.reads.push(PlanRead {
                        reference,
                        bundle_id: item.bundle_id,
                        offset:    item.offset,
                        size:      item.size,
                        super_blocks: vec![PlanSuperBlock {
                            size:   item.size,
                            blocks: vec![block],
                        }],
                    }),
                }
            }
        }

        debug!(
            "delta plan: {} read(s), {} super-block(s), {} block(s) wanted",
            plan.reads.len(),
            plan.reads.iter().map(|r| r.super_blocks.len()).sum::<usize>(),
            plan.reads
                .iter()
                .flat_map(|r| &r.super_blocks)
                .map(|s| s.blocks.len())
                .sum::<usize>(),
        );
        plan
    }
}

fn last_offset(read: &PlanRead) -> u64 {
    // Offset of the read's last super-block.
    read.offset + read.size - read.super_blocks.last().map_or(0, |s| s.size)
}

fn last_size(read: &PlanRead) -> u64 {
    read.super_blocks.last().map_or(0, |s| s.size)
}

// ── Execution ────────────────────────────────────────────────────────────────

/// One reconstructed block, ready to be written at `offset` in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaWrite {
    pub offset: u64,
    pub data:   Vec<u8>,
}

/// Pull-API executor over a [`DeltaPlan`].  State is resumable between calls;
/// block reads within the file are strictly sequential.
pub struct DeltaReader<'a> {
    plan:       &'a DeltaPlan,
    storage:    &'a dyn Storage,
    references: &'a [Label],
    /// Target path of the file inside each backup directory.
    file_name:  &'a str,
    pipeline:   &'a FilterPipeline,
    block_size: u64,

    read_idx:    usize,
    super_idx:   usize,
    /// Byte offset of the current super-block inside the current read.
    super_start: u64,
    current:     Option<DecodedSuper>,
}

struct DecodedSuper {
    /// Decoded plaintext block stream of the open super-block.
    data:       Vec<u8>,
    cursor:     usize,
    /// Ordinal of the next block the stream will yield.
    next_block: u64,
    /// Index into the plan super-block's wanted list.
    wanted_idx: usize,
}

impl<'a> DeltaReader<'a> {
    pub fn new(
        plan:       &'a DeltaPlan,
        storage:    &'a dyn Storage,
        references: &'a [Label],
        file_name:  &'a str,
        pipeline:   &'a FilterPipeline,
        block_size: u64,
    ) -> Self {
        Self {
            plan,
            storage,
            references,
            file_name,
            pipeline,
            block_size,
            read_idx: 0,
            super_idx: 0,
            super_start: 0,
            current: None,
        }
    }

    /// Repository object holding `read`'s bytes.
    fn object_path(&self, read: &PlanRead) -> Result<String> {
        let label = self
            .references
            .get(read.reference as usize)
            .ok_or_else(|| {
                Error::format(format!(
                    "block map reference {} outside the manifest reference list",
                    read.reference
                ))
            })?;
        Ok(if read.bundle_id > 0 {
            format!("backup/{label}/bundle/{}", read.bundle_id)
        } else {
            format!("backup/{label}/{}", self.file_name)
        })
    }

    /// Produce the next reconstructed block, or `None` when the plan is done.
    pub fn next(&mut self) -> Result<Option<DeltaWrite>> {
        loop {
            // Move to the next super-block that still has wanted blocks.
            if self.current.is_none() {
                let read = match self.plan.reads.get(self.read_idx) {
                    Some(r) => r,
                    None    => return Ok(None),
                };
                if self.super_idx >= read.super_blocks.len() {
                    self.read_idx += 1;
                    self.super_idx = 0;
                    self.super_start = 0;
                    continue;
                }

                let sb = &read.super_blocks[self.super_idx];
                let path = self.object_path(read)?;
                let framed =
                    self.storage
                        .read_range(&path, read.offset + self.super_start, sb.size)?;

                // Chunked frame → filter pipeline → plaintext block stream.
                let mut chunked = ChunkedRead::new(framed.as_slice());
                let mut encoded = Vec::new();
                std::io::Read::read_to_end(&mut chunked, &mut encoded)
                    .map_err(|e| Error::format(format!("'{}': {e}", self.file_name)))?;
                let data = self.pipeline.decode(&encoded)?;

                self.current = Some(DecodedSuper {
                    data,
                    cursor: 0,
                    next_block: 0,
                    wanted_idx: 0,
                });
            }

            let read = &self.plan.reads[self.read_idx];
            let sb = &read.super_blocks[self.super_idx];
            let state = self.current.as_mut().unwrap();

            if state.wanted_idx >= sb.blocks.len() {
                // Super-block exhausted; advance.
                self.super_start += sb.size;
                self.super_idx += 1;
                self.current = None;
                continue;
            }

            let wanted = &sb.blocks[state.wanted_idx];

            // Walk the block stream up to the wanted ordinal, discarding.
            let mut slice = &state.data[state.cursor..];
            let prefix = varint::read_u64(&mut slice).map_err(|_| {
                Error::format(format!(
                    "'{}': super-block ended before block {}",
                    self.file_name, wanted.block_no
                ))
            })?;
            let len = if prefix & 1 != 0 {
                (prefix >> 1) as usize
            } else {
                self.block_size as usize
            };
            let header = state.data.len() - state.cursor - slice.len();
            let start = state.cursor + header;
            let end = start + len;
            if end > state.data.len() {
                return Err(Error::format(format!(
                    "'{}': super-block block {} truncated",
                    self.file_name, state.next_block
                )));
            }

            let block_no = state.next_block;
            state.cursor = end;
            state.next_block += 1;

            if block_no < wanted.block_no {
                continue; // not wanted — read and discarded
            }
            if block_no > wanted.block_no {
                return Err(Error::format(format!(
                    "'{}': block {} missing from super-block stream",
                    self.file_name, wanted.block_no
                )));
            }

            let planned = self.plan.reads[self.read_idx].super_blocks[self.super_idx].blocks
                [state.wanted_idx]
                .clone();
            let bytes = self.current.as_ref().unwrap().data[start..end].to_vec();

            let actual = block_checksum(&bytes, planned.checksum.len());
            if actual != planned.checksum {
                return Err(Error::Checksum {
                    name:     format!("{} (block {})", self.file_name, block_no),
                    expected: hex::encode(&planned.checksum),
                    actual:   hex::encode(&actual),
                });
            }

            self.current.as_mut().unwrap().wanted_idx += 1;
            return Ok(Some(DeltaWrite { offset: planned.target_offset, data: bytes }));
        }
    }
}
