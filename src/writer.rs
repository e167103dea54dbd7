//! Block-incremental writer — produces `[ payload || map ]` objects.
//!
//! The writer ingests a file's plaintext in block-sized chunks.  Each block
//! is hashed and looked up in the prior backup's map for the same path: a
//! match emits a map item pointing at the prior super-block, a miss buffers
//! the block into a new super-block.  Super-blocks flush when the
//! accumulator reaches the target size or at end of file: the block stream
//! (each block varint-prefixed, bit 0 = explicit size) goes through the
//! filter pipeline, is chunk-framed, and is appended to the output object.
//! `finish` appends the encoded block map last, so the stored object is
//! `[ payload || map ]` with the map length recorded in the manifest.
//!
//! A map produced here, fed to the delta planner with an empty delta map,
//! reconstructs the exact original plaintext.

use std::io::Write;

use crate::blockmap::{self, BlockMap, BlockMapItem};
use crate::chunked::ChunkedWrite;
use crate::delta::block_checksum;
use crate::error::{Error, Result};
use crate::filter::FilterPipeline;
use crate::varint;

/// Default plaintext block size (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;
/// Default super-block target: 8 blocks per packaging unit.
pub const DEFAULT_SUPER_BLOCK_FACTOR: u64 = 8;
/// Default truncated-SHA-1 length stored per block.
pub const DEFAULT_CHECKSUM_SIZE: usize = 12;

/// Completed object: stored bytes plus the decoded form of its trailing map.
#[derive(Debug)]
pub struct BlockIncrFile {
    /// `[ payload || map ]`, ready to be stored.
    pub object:   Vec<u8>,
    pub map:      BlockMap,
    /// Encoded length of the trailing map (`block_incr_map_size`).
    pub map_size: u64,
}

pub struct BlockIncrWriter<'a> {
    block_size:       u64,
    super_block_size: u64,
    checksum_size:    usize,
    pipeline:         &'a FilterPipeline,
    /// Prior backup's map for this path; reference indices in it stay valid
    /// because the new reference list extends the prior one.
    prior:            Option<&'a BlockMap>,
    /// This backup's index in the manifest reference list.
    self_reference:   u32,

    object:  Vec<u8>,
    slots:   Vec<Option<BlockMapItem>>,
    /// Changed blocks awaiting a super-block flush: (file block index, data).
    pending: Vec<(usize, Vec<u8>)>,
    eof:     bool,
}

impl<'a> BlockIncrWriter<'a> {
    pub fn new(
        block_size:       u64,
        super_block_size: u64,
        checksum_size:    usize,
        pipeline:         &'a FilterPipeline,
        prior:            Option<&'a BlockMap>,
        self_reference:   u32,
    ) -> Result<Self> {
        if block_size == 0 || super_block_size == 0 || super_block_size % block_size != 0 {
            return Err(Error::format(
                "super-block size must be a positive multiple of the block size",
            ));
        }
        if checksum_size == 0 || checksum_size > 20 {
            return Err(Error::format("checksum size must be 1..=20 bytes"));
        }
        Ok(Self {
            block_size,
            super_block_size,
            checksum_size,
            pipeline,
            prior,
            self_reference,
            object:  Vec::new(),
            slots:   Vec::new(),
            pending: Vec::new(),
            eof:     false,
        })
    }

    /// Ingest the next plaintext block.  All blocks are `block_size` bytes
    /// except the file's final block, which may be short.
    pub fn write_block(&mut self, data: &[u8]) -> Result<()> {
        if self.eof {
            return Err(Error::format("block after a short (final) block"));
        }
        if data.is_empty() || data.len() as u64 > self.block_size {
            return Err(Error::format(format!(
                "block of {} bytes (block size {})",
                data.len(),
                self.block_size
            )));
        }
        if (data.len() as u64) < self.block_size {
            self.eof = true;
        }

        let idx = self.slots.len();
        let checksum = block_checksum(data, self.checksum_size);

        // Unchanged block: reuse the prior backup's reference.
        if let Some(prior_item) = self.prior.and_then(|p| p.get(idx)) {
            if prior_item.checksum == checksum {
                self.slots.push(Some(prior_item.clone()));
                return Ok(());
            }
        }

        self.pending.push((idx, data.to_vec()));
        self.slots.push(None);

        let buffered: u64 = self.pending.iter().map(|(_, d)| d.len() as u64).sum();
        if buffered >= self.super_block_size {
            self.flush_super_block()?;
        }
        Ok(())
    }

    /// Flush pending blocks as one super-block appended to the object.
    fn flush_super_block(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        // Plaintext block stream: varint prefix per block, bit 0 set when the
        // block carries an explicit (short) size.
        let mut stream = Vec::new();
        for (_, data) in &self.pending {
            if data.len() as u64 == self.block_size {
                varint::write_u64(&mut stream, 0)?;
            } else {
                varint::write_u64(&mut stream, ((data.len() as u64) << 1) | 1)?;
            }
            stream.extend_from_slice(data);
        }

        let encoded = self.pipeline.encode(&stream)?;
        let offset = self.object.len() as u64;
        let mut framed = ChunkedWrite::new(&mut self.object);
        framed.write_all(&encoded)?;
        framed.finish()?;
        let size = self.object.len() as u64 - offset;

        for (block, (idx, data)) in self.pending.drain(..).enumerate() {
            self.slots[idx] = Some(BlockMapItem {
                reference:        self.self_reference,
                bundle_id:        0,
                offset,
                size,
                super_block_size: self.super_block_size,
                block:            block as u64,
                checksum:         block_checksum(&data, self.checksum_size),
            });
        }
        Ok(())
    }

    /// Flush the tail super-block, encode the map, and seal the object.
    pub fn finish(mut self) -> Result<BlockIncrFile> {
        self.flush_super_block()?;

        let items: Result<Vec<BlockMapItem>> = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.ok_or_else(|| Error::format(format!("block {idx} never flushed")))
            })
            .collect();
        let map = BlockMap { items: items? };

        let mut object = self.object;
        let payload_len = object.len() as u64;
        blockmap::encode(&map, &mut object, self.block_size, self.checksum_size)?;
        let map_size = object.len() as u64 - payload_len;

        Ok(BlockIncrFile { object, map, map_size })
    }
}

/// Split `data` into block-sized chunks and run them through a writer.
/// Convenience for whole-file ingestion.
pub fn write_all(mut writer: BlockIncrWriter<'_>, data: &[u8]) -> Result<BlockIncrFile> {
    let block_size = writer.block_size as usize;
    for chunk in data.chunks(block_size) {
        writer.write_block(chunk)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaPlan, DeltaReader};
    use crate::filter::Compress;
    use crate::manifest::Label;
    use crate::storage::{MemoryStorage, Storage};

    const BS: u64 = 64;
    const SBS: u64 = BS * 4;
    const CS: usize = 8;

    fn pipeline() -> FilterPipeline {
        FilterPipeline::new(Compress::Lz4)
    }

    fn labels(names: &[&str]) -> Vec<Label> {
        names.iter().map(|n| Label::parse(n).unwrap()).collect()
    }

    /// Store an object and reconstruct it through the delta path.
    fn reconstruct(
        storage:    &MemoryStorage,
        label:      &str,
        name:       &str,
        file:       &BlockIncrFile,
        references: &[Label],
        size:       usize,
        p:          &FilterPipeline,
    ) -> Vec<u8> {
        storage
            .write(&format!("backup/{label}/{name}"), &file.object)
            .unwrap();
        let plan = DeltaPlan::build(&file.map, &[], BS);
        let mut reader = DeltaReader::new(&plan, storage, references, name, p, BS);
        let mut out = vec![0u8; size];
        while let Some(write) = reader.next().unwrap() {
            let start = write.offset as usize;
            out[start..start + write.data.len()].copy_from_slice(&write.data);
        }
        out
    }

    #[test]
    fn full_write_then_restore_roundtrip() {
        let p = pipeline();
        let data: Vec<u8> = (0..(BS as usize * 10 + 17)).map(|i| (i % 251) as u8).collect();

        let writer = BlockIncrWriter::new(BS, SBS, CS, &p, None, 0).unwrap();
        let file = write_all(writer, &data).unwrap();
        assert_eq!(file.map.len(), 11);
        assert!(file.map_size > 0);

        // The trailing map_size bytes decode back to the same map.
        let tail = &file.object[file.object.len() - file.map_size as usize..];
        let decoded = crate::blockmap::decode(&mut &tail[..], BS, CS).unwrap();
        assert_eq!(decoded, file.map);

        let storage = MemoryStorage::new();
        let refs = labels(&["20240101-000000F"]);
        let out = reconstruct(&storage, "20240101-000000F", "base/1/1", &file, &refs, data.len(), &p);
        assert_eq!(out, data);
    }

    #[test]
    fn unchanged_blocks_reference_the_prior_backup() {
        let p = pipeline();
        let storage = MemoryStorage::new();
        let refs = labels(&["20240101-000000F", "20240101-000000F_20240102-000000I"]);

        // Backup A: three blocks.
        let mut data: Vec<u8> = Vec::new();
        for b in 0u8..3 {
            data.extend(std::iter::repeat(b).take(BS as usize));
        }
        let writer = BlockIncrWriter::new(BS, SBS, CS, &p, None, 0).unwrap();
        let a = write_all(writer, &data).unwrap();
        storage
            .write("backup/20240101-000000F/base/1/1", &a.object)
            .unwrap();

        // Backup B: block 1 rewritten.
        let mut changed = data.clone();
        changed[BS as usize..2 * BS as usize].fill(0xAA);
        let writer = BlockIncrWriter::new(BS, SBS, CS, &p, Some(&a.map), 1).unwrap();
        let b = write_all(writer, &changed).unwrap();

        // Blocks 0 and 2 stay on reference 0; block 1 moved to reference 1.
        assert_eq!(b.map.items[0].reference, 0);
        assert_eq!(b.map.items[1].reference, 1);
        assert_eq!(b.map.items[2].reference, 0);
        assert_eq!(b.map.items[0], a.map.items[0]);
        assert_eq!(b.map.items[2], a.map.items[2]);

        // Restoring B with an empty delta map yields A's blocks 0 and 2 and
        // B's block 1.
        let out = reconstruct(
            &storage,
            "20240101-000000F_20240102-000000I",
            "base/1/1",
            &b,
            &refs,
            changed.len(),
            &p,
        );
        assert_eq!(out, changed);
    }

    #[test]
    fn delta_restore_reads_only_stale_blocks() {
        let p = pipeline();
        let data: Vec<u8> = (0..(BS as usize * 8)).map(|i| (i / 3) as u8).collect();
        let writer = BlockIncrWriter::new(BS, BS, CS, &p, None, 0).unwrap();
        let file = write_all(writer, &data).unwrap();

        // Local copy diverges in exactly one block.
        let delta: Vec<Vec<u8>> = data
            .chunks(BS as usize)
            .enumerate()
            .map(|(i, chunk)| {
                if i == 3 {
                    block_checksum(b"locally modified", CS)
                } else {
                    block_checksum(chunk, CS)
                }
            })
            .collect();
        let plan = DeltaPlan::build(&file.map, &delta, BS);
        let wanted: usize = plan
            .reads
            .iter()
            .flat_map(|r| &r.super_blocks)
            .map(|s| s.blocks.len())
            .sum();
        assert_eq!(wanted, 1);
    }

    #[test]
    fn encrypted_pipeline_roundtrip() {
        let key = crate::filter::derive_key("passphrase", b"main").unwrap();
        let p = FilterPipeline::new(Compress::Zst).with_key(Some(key));
        let data: Vec<u8> = (0..(BS as usize * 5 + 5)).map(|i| (i % 7) as u8).collect();

        let writer = BlockIncrWriter::new(BS, SBS, CS, &p, None, 0).unwrap();
        let file = write_all(writer, &data).unwrap();

        let storage = MemoryStorage::new();
        let refs = labels(&["20240101-000000F"]);
        let out = reconstruct(&storage, "20240101-000000F", "base/1/1", &file, &refs, data.len(), &p);
        assert_eq!(out, data);
    }

    #[test]
    fn tampered_block_fails_restore_checksum() {
        let p = FilterPipeline::new(Compress::None);
        let data = vec![7u8; BS as usize * 2];
        let writer = BlockIncrWriter::new(BS, SBS, CS, &p, None, 0).unwrap();
        let mut file = write_all(writer, &data).unwrap();

        // Flip a payload byte inside the stored object (past the chunk
        // header, before the map).
        file.object[10] ^= 0xFF;

        let storage = MemoryStorage::new();
        storage
            .write("backup/20240101-000000F/base/1/1", &file.object)
            .unwrap();
        let refs = labels(&["20240101-000000F"]);
        let plan = DeltaPlan::build(&file.map, &[], BS);
        let mut reader = DeltaReader::new(&plan, &storage, &refs, "base/1/1", &p, BS);
        let mut failed = false;
        loop {
            match reader.next() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(Error::Checksum { .. }) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(failed, "corruption must surface as a checksum error");
    }
}
