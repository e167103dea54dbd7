//! Block map — the trailing index of a block-incremental file.
//!
//! A block-incremental repository object is `[ payload || map ]`; this module
//! encodes and decodes the map.  Item *i* of the map describes logical file
//! block *i*: which prior backup (`reference`) physically stores it, where its
//! super-block lives inside that backup's object or bundle (`offset`, `size`),
//! its ordinal within the super-block (`block`), and the checksum of its
//! plaintext.
//!
//! # Wire format
//!
//! ```text
//! flags        varint   bit 0 = version (MUST be 0), bit 1 = equal
//!
//! per reference appearance, until a refEncoded with bit 0 set is consumed:
//!   refEncoded varint   bit 0 = last-reference-in-map
//!                       bit 1 = has-bundle-id      (first appearance)
//!                               continues-prior-super-block (repeat)
//!                       bit 2 = has-offset         (first appearance)
//!                               prior-super-block-is-last (repeat, bit 1 set)
//!                               has-offset-gap     (repeat, bit 1 clear)
//!                       rest  = reference index
//!   [varint bundleId]              first appearance, bit 1
//!   [varint offset | offset gap]   first appearance bit 2 / repeat bit 2
//!   [varint superBlockSize/blockSize - 1]   first appearance, equal clear
//!
//!   per super-block:
//!     superEncoded varint  bit 0 = last-super-block-in-reference
//!                          rest  = size (first super-block in map)
//!                                  zig-zag delta from prior size (otherwise)
//!     [blockTotalEncoded varint    equal clear:
//!          bit 0 = has-block-offset, rest = blockTotal - 1]
//!     [varint block gap            equal clear, has-block-offset]
//!     blockTotal × checksum        checksumSize bytes each, block order
//! ```
//!
//! A *repeat* appearance with the continuation bit re-enters the reference's
//! stored super-block without re-emitting its size: its block list continues
//! the stored block numbering, and bit 2 tells whether that pseudo-super-block
//! is the last one the appearance holds.  A repeat without the continuation
//! bit opens a fresh super-block at `stored.offset + stored.size` plus an
//! optional gap.  Consecutive super-blocks inside one appearance are always
//! wire-contiguous; any discontinuity ends the appearance.
//!
//! # Failure semantics
//! Non-zero version bit, mid-stream EOF, a decoded super-block size of zero,
//! and a zero block total outside `equal` mode are all fatal format errors.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::varint;

// ── Model ────────────────────────────────────────────────────────────────────

/// One logical file block's location in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapItem {
    /// Index into the manifest's reference list (which backup stores it).
    pub reference:        u32,
    /// Bundle holding the repository object; 0 when not bundled.
    pub bundle_id:        u64,
    /// Super-block start inside the object or bundle.
    pub offset:           u64,
    /// Super-block total stored (compressed/encrypted) size.
    pub size:             u64,
    /// Plaintext bytes the super-block packages; positive multiple of the
    /// block size.
    pub super_block_size: u64,
    /// The block's ordinal within its super-block.
    pub block:            u64,
    /// Plaintext checksum, `checksum_size` bytes.
    pub checksum:         Vec<u8>,
}

/// Ordered block index: item *i* describes logical file block *i*.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    pub items: Vec<BlockMapItem>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, block_idx: usize) -> Option<&BlockMapItem> {
        self.items.get(block_idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockMapItem> {
        self.items.iter()
    }
}

const FLAG_VERSION: u64 = 1 << 0;
const FLAG_EQUAL:   u64 = 1 << 1;

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Per-reference decoder state, recorded at the reference's first appearance
/// and advanced as super-blocks are consumed.
struct RefState {
    bundle_id:        u64,
    offset:           u64,
    size:             u64,
    block:            u64,
    super_block_size: u64,
}

/// Decode a block map.  Items come out in file order.
pub fn decode<R: Read>(r: &mut R, block_size: u64, checksum_size: usize) -> Result<BlockMap> {
    if block_size == 0 {
        return Err(Error::format("block size must be positive"));
    }

    let flags = varint::read_u64(r)?;
    if flags & FLAG_VERSION != 0 {
        return Err(Error::format("block map version must be zero"));
    }
    let equal = flags & FLAG_EQUAL != 0;

    let mut map = BlockMap::new();
    // Sparse reference indices are legal; a map grows one state slot per
    // reference it actually names.
    let mut states: HashMap<u32, RefState> = HashMap::new();
    let mut first_size_seen = false;
    let mut last_size = 0u64;

    loop {
        let ref_encoded = varint::read_u64(r)?;
        let last_reference = ref_encoded & 1 != 0;
        let bit1 = ref_encoded & 2 != 0;
        let bit2 = ref_encoded & 4 != 0;
        let reference = u32::try_from(ref_encoded >> 3)
            .map_err(|_| Error::format("reference index exceeds u32"))?;

        let seen = states.contains_key(&reference);

        if !seen {
            // First appearance: bit 1 = has-bundle-id, bit 2 = has-offset.
            let bundle_id = if bit1 { varint::read_u64(r)? } else { 0 };
            let offset = if bit2 { varint::read_u64(r)? } else { 0 };
            let super_block_size = if equal {
                block_size
            } else {
                let ratio = varint::read_u64(r)?;
                (ratio + 1)
                    .checked_mul(block_size)
                    .ok_or_else(|| Error::format("super-block size overflow"))?
            };
            states.insert(
                reference,
                RefState { bundle_id, offset, size: 0, block: 0, super_block_size },
            );
        } else if bit1 {
            // Repeat + continuation: re-enter the stored super-block.  Its
            // block numbering carries on; no size is re-emitted.  Impossible
            // under `equal` — a single-block super-block cannot be re-entered.
            if equal {
                return Err(Error::format("continuation in equal-mode map"));
            }
            let state = states.get_mut(&reference).unwrap();
            if state.size == 0 {
                return Err(Error::format(
                    "continuation of a reference with no prior super-block",
                ));
            }
            read_blocks(r, equal, checksum_size, reference, state, false, &mut map)?;
            // Bit 2 set: the pseudo-super-block is the reference's last in
            // this appearance — no super-block list follows.
            if bit2 {
                if last_reference {
                    break;
                }
                continue;
            }
        } else {
            // Repeat without continuation: fresh super-block past the stored
            // one, with an optional gap.
            let gap = if bit2 { varint::read_u64(r)? } else { 0 };
            let state = states.get_mut(&reference).unwrap();
            state.offset = state
                .offset
                .checked_add(state.size)
                .and_then(|o| o.checked_add(gap))
                .ok_or_else(|| Error::format("reference offset overflow"))?;
            state.size = 0;
        }

        // Super-block list for this appearance.
        loop {
            let super_encoded = varint::read_u64(r)?;
            let last_super = super_encoded & 1 != 0;
            let rest = super_encoded >> 1;

            let size = if !first_size_seen {
                first_size_seen = true;
                rest
            } else {
                let delta = varint::unzigzag(rest);
                let sized = (last_size as i64)
                    .checked_add(delta)
                    .ok_or_else(|| Error::format("super-block size delta overflow"))?;
                u64::try_from(sized)
                    .map_err(|_| Error::format("negative super-block size"))?
            };
            if size == 0 {
                return Err(Error::format("super-block size must be positive"));
            }
            last_size = size;

            let state = states.get_mut(&reference).unwrap();
            // The appearance's first super-block sits at the offset the
            // refEncoded established (state.size == 0); later ones are
            // wire-contiguous.
            if state.size != 0 {
                state.offset = state
                    .offset
                    .checked_add(state.size)
                    .ok_or_else(|| Error::format("reference offset overflow"))?;
            }
            state.size = size;
            read_blocks(r, equal, checksum_size, reference, state, true, &mut map)?;

            if last_super {
                break;
            }
        }

        if last_reference {
            break;
        }
    }

    Ok(map)
}

/// Read one super-block's block list and append the decoded items.
/// `fresh` restarts block numbering; a continuation keeps the stored ordinal.
fn read_blocks<R: Read>(
    r:             &mut R,
    equal:         bool,
    checksum_size: usize,
    reference:     u32,
    state:         &mut RefState,
    fresh:         bool,
    map:           &mut BlockMap,
) -> Result<()> {
    if fresh {
        state.block = 0;
    }
    let block_total = if equal {
        1
    } else {
        let encoded = varint::read_u64(r)?;
        let total = (encoded >> 1) + 1;
        if encoded & 1 != 0 {
            state.block = state
                .block
                .checked_add(varint::read_u64(r)?)
                .ok_or_else(|| Error::format("block ordinal overflow"))?;
        }
        total
    };

    for _ in 0..block_total {
        let mut checksum = vec![0u8; checksum_size];
        r.read_exact(&mut checksum)
            .map_err(|_| Error::format("unexpected EOF in block checksum"))?;
        map.items.push(BlockMapItem {
            reference,
            bundle_id:        state.bundle_id,
            offset:           state.offset,
            size:             state.size,
            super_block_size: state.super_block_size,
            block:            state.block,
            checksum,
        });
        state.block += 1;
    }
    Ok(())
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Encoder-side appearance plan, resolved in a first pass so the
/// last-reference and last-super-block bits can be written going forward.
struct Appearance {
    reference: u32,
    entry:     RefEntry,
    supers:    Vec<SuperEnc>,
}

enum RefEntry {
    First {
        bundle_id: Option<u64>,
        offset:    Option<u64>,
        sbs_ratio: Option<u64>,
    },
    Repeat {
        offset_gap: Option<u64>,
    },
    /// Pseudo-super-block continuing the stored one; `supers[0]` carries its
    /// block run and no size.
    Continue,
}

struct SuperEnc {
    /// Absolute wire size; the emit pass delta-encodes.  `None` re-enters the
    /// stored super-block (continuation).
    size:        Option<u64>,
    block_gap:   u64,
    /// Item index range in the map (contiguous block run).
    items:       std::ops::Range<usize>,
}

/// Encoder-side mirror of the decoder's reference state.
struct EncState {
    bundle_id:        u64,
    offset:           u64,
    size:             u64,
    next_block:       u64,
    super_block_size: u64,
}

/// Encode a block map.
///
/// The map must be well-formed: non-empty, every checksum `checksum_size`
/// bytes, every `super_block_size` a positive multiple of `block_size` and
/// uniform per reference, and each reference's super-blocks visited in
/// ascending offset order.  The `equal` flag is detected, not requested:
/// it is set iff every item's super-block holds exactly one block.
pub fn encode<W: Write>(
    map:           &BlockMap,
    w:             &mut W,
    block_size:    u64,
    checksum_size: usize,
) -> Result<()> {
    if block_size == 0 {
        return Err(Error::format("block size must be positive"));
    }
    if map.is_empty() {
        return Err(Error::format("refusing to encode an empty block map"));
    }
    for (idx, item) in map.iter().enumerate() {
        if item.checksum.len() != checksum_size {
            return Err(Error::format(format!(
                "item {idx}: checksum length {} != {checksum_size}",
                item.checksum.len()
            )));
        }
        if item.size == 0 {
            return Err(Error::format(format!("item {idx}: super-block size is zero")));
        }
        if item.super_block_size == 0 || item.super_block_size % block_size != 0 {
            return Err(Error::format(format!(
                "item {idx}: super-block plaintext size {} not a positive multiple of {block_size}",
                item.super_block_size
            )));
        }
    }

    let equal = map
        .iter()
        .all(|i| i.super_block_size == block_size && i.block == 0);

    let appearances = plan_appearances(map, block_size, equal)?;
    emit(map, w, equal, &appearances)
}

fn plan_appearances(map: &BlockMap, block_size: u64, equal: bool) -> Result<Vec<Appearance>> {
    let mut states: HashMap<u32, EncState> = HashMap::new();
    let mut appearances: Vec<Appearance> = Vec::new();

    let mut idx = 0;
    while idx < map.len() {
        let first_item = &map.items[idx];
        let reference = first_item.reference;

        let entry = match states.get(&reference) {
            None => {
                states.insert(
                    reference,
                    EncState {
                        bundle_id:        first_item.bundle_id,
                        offset:           first_item.offset,
                        size:             0,
                        next_block:       0,
                        super_block_size: first_item.super_block_size,
                    },
                );
                RefEntry::First {
                    bundle_id: (first_item.bundle_id != 0).then_some(first_item.bundle_id),
                    offset:    (first_item.offset != 0).then_some(first_item.offset),
                    sbs_ratio: (!equal).then(|| first_item.super_block_size / block_size - 1),
                }
            }
            Some(state) => {
                if first_item.bundle_id != state.bundle_id {
                    return Err(Error::format(format!(
                        "reference {reference}: bundle id changed mid-map"
                    )));
                }
                if first_item.super_block_size != state.super_block_size {
                    return Err(Error::format(format!(
                        "reference {reference}: super-block size changed mid-map"
                    )));
                }
                if first_item.offset == state.offset && first_item.size == state.size {
                    if first_item.block < state.next_block {
                        return Err(Error::format(format!(
                            "reference {reference}: block ordinal regressed within super-block"
                        )));
                    }
                    RefEntry::Continue
                } else {
                    let past_end = state
                        .offset
                        .checked_add(state.size)
                        .ok_or_else(|| Error::format("reference offset overflow"))?;
                    if first_item.offset < past_end {
                        return Err(Error::format(format!(
                            "reference {reference}: super-block offsets must ascend"
                        )));
                    }
                    let gap = first_item.offset - past_end;
                    RefEntry::Repeat { offset_gap: (gap > 0).then_some(gap) }
                }
            }
        };

        // Collect this appearance's super-block runs.
        let continuation = matches!(entry, RefEntry::Continue);
        let mut supers: Vec<SuperEnc> = Vec::new();
        {
            let state = states.get_mut(&reference).unwrap();
            if !continuation {
                state.offset = first_item.offset;
                state.size = 0;
            }

            loop {
                if idx >= map.len() || map.items[idx].reference != reference {
                    break;
                }
                let item = &map.items[idx];

                let (pseudo, expected_offset) = if state.size == 0 {
                    (false, state.offset)
                } else if continuation && supers.is_empty() {
                    (true, state.offset)
                } else {
                    (false, state.offset + state.size)
                };

                if item.offset != expected_offset {
                    break;
                }
                if !pseudo && state.size != 0 {
                    // Contiguous fresh super-block inside the appearance.
                    state.offset = expected_offset;
                    state.size = 0;
                }
                if pseudo && item.size != state.size {
                    return Err(Error::format(format!(
                        "reference {reference}: continued super-block size changed"
                    )));
                }

                // One contiguous block run within this super-block.
                let start_block = item.block;
                let base_block = if pseudo { state.next_block } else { 0 };
                if start_block < base_block {
                    break;
                }
                let block_gap = start_block - base_block;
                if equal && (block_gap != 0 || item.block != 0) {
                    return Err(Error::format("equal-mode map with non-zero block ordinal"));
                }

                let run_start = idx;
                let mut next_block = start_block;
                while idx < map.len() {
                    let it = &map.items[idx];
                    if it.reference != reference
                        || it.offset != item.offset
                        || it.block != next_block
                    {
                        break;
                    }
                    if it.size != item.size {
                        return Err(Error::format(format!(
                            "reference {reference}: super-block size changed within run"
                        )));
                    }
                    next_block += 1;
                    idx += 1;
                }

                supers.push(SuperEnc {
                    size:      (!pseudo).then_some(item.size),
                    block_gap,
                    items:     run_start..idx,
                });
                state.size = item.size;
                state.next_block = next_block;
            }
        }

        if supers.is_empty() {
            return Err(Error::format("appearance resolved to no super-blocks"));
        }
        appearances.push(Appearance { reference, entry, supers });
    }

    Ok(appearances)
}

fn emit<W: Write>(
    map:         &BlockMap,
    w:           &mut W,
    equal:       bool,
    appearances: &[Appearance],
) -> Result<()> {
    varint::write_u64(w, if equal { FLAG_EQUAL } else { 0 })?;

    let mut first_size_written = false;
    let mut last_size = 0u64;

    for (a_idx, app) in appearances.iter().enumerate() {
        let last_reference = a_idx == appearances.len() - 1;

        let (bit1, bit2) = match &app.entry {
            RefEntry::First { bundle_id, offset, .. } => {
                (bundle_id.is_some(), offset.is_some())
            }
            RefEntry::Repeat { offset_gap } => (false, offset_gap.is_some()),
            RefEntry::Continue => (true, app.supers.len() == 1),
        };
        let ref_encoded = (u64::from(app.reference) << 3)
            | (u64::from(bit2) << 2)
            | (u64::from(bit1) << 1)
            | u64::from(last_reference);
        varint::write_u64(w, ref_encoded)?;

        match &app.entry {
            RefEntry::First { bundle_id, offset, sbs_ratio } => {
                if let Some(b) = bundle_id {
                    varint::write_u64(w, *b)?;
                }
                if let Some(o) = offset {
                    varint::write_u64(w, *o)?;
                }
                if let Some(ratio) = sbs_ratio {
                    varint::write_u64(w, *ratio)?;
                }
            }
            RefEntry::Repeat { offset_gap } => {
                if let Some(g) = offset_gap {
                    varint::write_u64(w, *g)?;
                }
            }
            RefEntry::Continue => {}
        }

        for (s_idx, sb) in app.supers.iter().enumerate() {
            let last_super = s_idx == app.supers.len() - 1;

            if let Some(size) = sb.size {
                let rest = if !first_size_written {
                    first_size_written = true;
                    size
                } else {
                    varint::zigzag(size as i64 - last_size as i64)
                };
                last_size = size;
                varint::write_u64(w, (rest << 1) | u64::from(last_super))?;
            }

            if !equal {
                let total = sb.items.len() as u64;
                let has_gap = sb.block_gap > 0;
                varint::write_u64(w, ((total - 1) << 1) | u64::from(has_gap))?;
                if has_gap {
                    varint::write_u64(w, sb.block_gap)?;
                }
            }
            for item in &map.items[sb.items.clone()] {
                w.write_all(&item.checksum)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = 128;
    const CS: usize = 6;

    fn ck(seed: u8) -> Vec<u8> {
        vec![seed; CS]
    }

    fn item(
        reference: u32,
        bundle_id: u64,
        offset: u64,
        size: u64,
        sbs: u64,
        block: u64,
        seed: u8,
    ) -> BlockMapItem {
        BlockMapItem {
            reference,
            bundle_id,
            offset,
            size,
            super_block_size: sbs,
            block,
            checksum: ck(seed),
        }
    }

    fn roundtrip(map: &BlockMap) -> BlockMap {
        let mut wire = Vec::new();
        encode(map, &mut wire, BS, CS).unwrap();
        decode(&mut wire.as_slice(), BS, CS).unwrap()
    }

    #[test]
    fn equal_mode_single_reference() {
        // Three single-block super-blocks, contiguous on the wire.
        let map = BlockMap {
            items: vec![
                item(0, 0, 0, 90, BS, 0, 1),
                item(0, 0, 90, 84, BS, 0, 2),
                item(0, 0, 174, 96, BS, 0, 3),
            ],
        };
        let mut wire = Vec::new();
        encode(&map, &mut wire, BS, CS).unwrap();
        // flags carries the equal bit.
        assert_eq!(wire[0] & 0x3, 0x2);
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn multi_block_super_blocks() {
        let map = BlockMap {
            items: vec![
                item(0, 0, 0, 300, BS * 4, 0, 1),
                item(0, 0, 0, 300, BS * 4, 1, 2),
                item(0, 0, 0, 300, BS * 4, 2, 3),
                item(0, 0, 0, 300, BS * 4, 3, 4),
                item(0, 0, 300, 120, BS * 4, 0, 5),
            ],
        };
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn interleaved_references_and_continuation() {
        // Backup chain: file blocks 0 and 2 live in reference 0's super-block
        // at offset 0; block 1 was rewritten and lives in reference 1.  The
        // second appearance of reference 0 re-enters the same super-block
        // with a block gap — the continuation path.
        let map = BlockMap {
            items: vec![
                item(0, 0, 0, 500, BS * 4, 0, 1),
                item(1, 0, 0, 200, BS * 4, 0, 9),
                item(0, 0, 0, 500, BS * 4, 2, 3),
            ],
        };
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn repeat_with_offset_gap() {
        let map = BlockMap {
            items: vec![
                item(2, 0, 100, 400, BS * 2, 0, 1),
                item(2, 0, 100, 400, BS * 2, 1, 2),
                item(1, 0, 0, 250, BS * 2, 0, 3),
                // Re-enter reference 2 past a 60-byte hole.
                item(2, 0, 560, 380, BS * 2, 0, 4),
            ],
        };
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn bundled_reference_carries_bundle_id() {
        let map = BlockMap {
            items: vec![
                item(0, 7, 4096, 300, BS * 2, 0, 1),
                item(0, 7, 4096, 300, BS * 2, 1, 2),
            ],
        };
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn fresh_super_block_with_block_gap() {
        // Only the tail blocks of reference 0's super-block are wanted.
        let map = BlockMap {
            items: vec![
                item(1, 0, 0, 220, BS * 8, 0, 1),
                item(0, 0, 0, 900, BS * 8, 5, 2),
                item(0, 0, 0, 900, BS * 8, 6, 3),
            ],
        };
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn continuation_then_more_super_blocks() {
        // The continued super-block is not the last for the reference: a
        // fresh contiguous super-block follows inside the same appearance.
        let map = BlockMap {
            items: vec![
                item(0, 0, 0, 500, BS * 4, 0, 1),
                item(1, 0, 0, 200, BS * 4, 0, 9),
                item(0, 0, 0, 500, BS * 4, 2, 3),
                item(0, 0, 500, 450, BS * 4, 0, 4),
            ],
        };
        assert_eq!(roundtrip(&map), map);
    }

    #[test]
    fn version_bit_rejected() {
        let mut wire = Vec::new();
        crate::varint::write_u64(&mut wire, 1).unwrap();
        let err = decode(&mut wire.as_slice(), BS, CS).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn truncated_map_is_format_error() {
        let map = BlockMap {
            items: vec![
                item(0, 0, 0, 300, BS * 2, 0, 1),
                item(0, 0, 0, 300, BS * 2, 1, 2),
            ],
        };
        let mut wire = Vec::new();
        encode(&map, &mut wire, BS, CS).unwrap();
        for cut in 1..wire.len() {
            assert!(
                decode(&mut wire[..cut].as_ref(), BS, CS).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn zero_size_super_block_rejected() {
        let map = BlockMap { items: vec![item(0, 0, 0, 0, BS, 0, 1)] };
        let mut wire = Vec::new();
        assert!(encode(&map, &mut wire, BS, CS).is_err());

        // Hand-built wire: flags 0, first appearance of ref 0 with ratio 0,
        // then a super-block whose decoded size is zero.
        let mut bad = Vec::new();
        crate::varint::write_u64(&mut bad, 0).unwrap(); // flags
        crate::varint::write_u64(&mut bad, 1).unwrap(); // ref 0, last
        crate::varint::write_u64(&mut bad, 0).unwrap(); // sbs ratio
        crate::varint::write_u64(&mut bad, 1).unwrap(); // size 0, last super
        assert!(decode(&mut bad.as_slice(), BS, CS).is_err());
    }

    #[test]
    fn empty_map_refused() {
        let mut wire = Vec::new();
        assert!(encode(&BlockMap::new(), &mut wire, BS, CS).is_err());
    }

    #[test]
    fn descending_offsets_refused() {
        let map = BlockMap {
            items: vec![
                item(0, 0, 500, 300, BS, 0, 1),
                item(1, 0, 0, 100, BS, 0, 2),
                item(0, 0, 0, 300, BS, 0, 3),
            ],
        };
        let mut wire = Vec::new();
        assert!(encode(&map, &mut wire, BS, CS).is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        /// Generate a structurally valid map: a chain of references, each
        /// with ascending contiguous super-blocks and full block runs.
        fn arb_map() -> impl Strategy<Value = BlockMap> {
            (1usize..5, 1u64..4, 1usize..6).prop_flat_map(|(refs, blocks_per_sb, sbs_per_ref)| {
                proptest::collection::vec(60u64..600, refs * sbs_per_ref).prop_map(
                    move |sizes| {
                        let mut items = Vec::new();
                        let mut size_iter = sizes.into_iter();
                        for reference in 0..refs as u32 {
                            let mut offset = 0u64;
                            for _ in 0..sbs_per_ref {
                                let size = size_iter.next().unwrap();
                                for block in 0..blocks_per_sb {
                                    let mut checksum = vec![0u8; CS];
                                    checksum[0] = reference as u8;
                                    checksum[1] = (offset % 251) as u8;
                                    checksum[2] = block as u8;
                                    items.push(BlockMapItem {
                                        reference,
                                        bundle_id: 0,
                                        offset,
                                        size,
                                        super_block_size: BS * blocks_per_sb,
                                        block,
                                        checksum,
                                    });
                                }
                                offset += size;
                            }
                        }
                        BlockMap { items }
                    },
                )
            })
        }

        proptest! {
            #[test]
            fn roundtrip_generated_maps(map in arb_map()) {
                let mut wire = Vec::new();
                encode(&map, &mut wire, BS, CS).unwrap();
                let decoded = decode(&mut wire.as_slice(), BS, CS).unwrap();
                prop_assert_eq!(decoded, map);
            }
        }
    }
}
