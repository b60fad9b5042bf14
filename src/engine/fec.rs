//! Block-XOR forward error correction.
//!
//! Data chunks are grouped into blocks of `k`; each block gets `r`
//! parity chunks appended after all data chunks:
//!
//! ```text
//! parity chunk_id = num_data + block_id * r + ordinal
//! ```
//!
//! Parity ordinal 0 is the overall stripe (XOR of every member);
//! ordinals p >= 1 are interleaved stripes over in-block indices
//! `i % r == p - 1`, degenerating to the overall stripe when the
//! interleave is empty (short final block). Any single missing data
//! chunk is recoverable from the rest of the block plus a parity whose
//! mask covers it.
//!
//! Parity is XORed over *length-prefixed* member buffers
//! (`len:u16 BE || payload`, zero-padded to the longest member). The
//! prefix survives XOR recovery, so a reconstructed final chunk comes
//! back at its exact byte length instead of zero-padded to the block
//! maximum.

/// In-block data indices covered by a parity ordinal.
pub fn parity_mask(ordinal: u8, block_size: usize, r: u8) -> Vec<usize> {
    if ordinal == 0 || r <= 1 {
        return (0..block_size).collect();
    }
    let stripe: Vec<usize> = (0..block_size)
        .filter(|i| i % r as usize == (ordinal - 1) as usize)
        .collect();
    if stripe.is_empty() {
        // Tiny final block: fall back to the overall stripe
        (0..block_size).collect()
    } else {
        stripe
    }
}

/// Number of FEC blocks for `num_data` data chunks in groups of `k`.
pub fn num_blocks(num_data: u32, k: u8) -> u32 {
    if k == 0 {
        return 0;
    }
    num_data.div_ceil(k as u32)
}

/// Block id containing a data chunk.
pub fn block_of(chunk_id: u32, k: u8) -> u32 {
    if k == 0 {
        0
    } else {
        chunk_id / k as u32
    }
}

/// Data chunk id range `[start, end)` of a block.
pub fn block_data_range(block_id: u32, k: u8, num_data: u32) -> (u32, u32) {
    let start = block_id * k as u32;
    let end = (start + k as u32).min(num_data);
    (start, end)
}

/// Chunk id of a parity chunk.
pub fn parity_chunk_id(num_data: u32, block_id: u32, r: u8, ordinal: u8) -> u32 {
    num_data + block_id * r as u32 + ordinal as u32
}

/// Decompose a parity chunk id into (block_id, ordinal).
/// Returns None for ids below `num_data`.
pub fn parity_position(chunk_id: u32, num_data: u32, r: u8) -> Option<(u32, u8)> {
    if chunk_id < num_data || r == 0 {
        return None;
    }
    let offset = chunk_id - num_data;
    Some((offset / r as u32, (offset % r as u32) as u8))
}

/// Infer the data chunk count from (total_chunks, k, r).
///
/// Searches the block count B satisfying `total = num_data + r*B` and
/// `k*(B-1) < num_data <= k*B`. Returns None when no layout fits, in
/// which case FEC must be disabled for the bundle.
pub fn infer_num_data(total_chunks: u32, k: u8, r: u8) -> Option<u32> {
    if k == 0 || r == 0 {
        return None;
    }
    let (k, r) = (k as u32, r as u32);
    for blocks in 1..=total_chunks {
        let Some(num_data) = total_chunks.checked_sub(r * blocks) else {
            break;
        };
        if num_data == 0 {
            continue;
        }
        if k * (blocks - 1) < num_data && num_data <= k * blocks {
            return Some(num_data);
        }
    }
    None
}

/// XOR `member` (length-prefixed) into `acc`, extending `acc` as needed.
fn xor_prefixed_into(acc: &mut Vec<u8>, member: &[u8]) {
    let prefixed_len = member.len() + 2;
    if acc.len() < prefixed_len {
        acc.resize(prefixed_len, 0);
    }
    let len_bytes = (member.len() as u16).to_be_bytes();
    acc[0] ^= len_bytes[0];
    acc[1] ^= len_bytes[1];
    for (i, byte) in member.iter().enumerate() {
        acc[2 + i] ^= byte;
    }
}

/// Generate the `r` parity payloads for one block of data payloads.
pub fn generate_block_parity(members: &[&[u8]], r: u8) -> Vec<Vec<u8>> {
    let mut parities = Vec::with_capacity(r as usize);
    for ordinal in 0..r {
        let mask = parity_mask(ordinal, members.len(), r);
        let mut acc = Vec::new();
        for &idx in &mask {
            xor_prefixed_into(&mut acc, members[idx]);
        }
        parities.push(acc);
    }
    parities
}

/// Recover one missing member from a parity payload.
///
/// `present` maps each in-block index of the parity's mask (except the
/// missing one) to its payload. Returns the missing member at its exact
/// original length, or None when the XOR result is inconsistent.
pub fn recover_member(
    parity_payload: &[u8],
    present: impl Fn(usize) -> Option<Vec<u8>>,
    mask: &[usize],
    missing: usize,
) -> Option<Vec<u8>> {
    if !mask.contains(&missing) {
        return None;
    }

    let mut acc = parity_payload.to_vec();
    for &idx in mask {
        if idx == missing {
            continue;
        }
        xor_prefixed_into(&mut acc, &present(idx)?);
    }

    if acc.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([acc[0], acc[1]]) as usize;
    if len + 2 > acc.len() {
        return None;
    }
    // Bytes beyond the recovered length must have XORed out to zero
    if acc[2 + len..].iter().any(|&b| b != 0) {
        return None;
    }
    Some(acc[2..2 + len].to_vec())
}
