//! Prefix compression for data blocks. A sorted batch of pairs is partitioned into blocks
//! where each block stores one shared key prefix and per-key suffixes, chosen to minimize
//! the total bytes stored.

use super::{DataBlock, Pair};

/// The length of the longest common prefix of two keys.
fn lcp_len(a: &[u8], b: &[u8]) -> usize {
    let max = a.len().min(b.len());
    let mut len = 0;
    while len < max && a[len] == b[len] {
        len += 1;
    }
    len
}

/// Splits a sorted list of pairs into optimally prefixed blocks. Concatenating `prefixes[i]`
/// with each of `blocks[i].keys` reproduces the original keys in order.
///
/// The savings of a block `[i..j]` are `(j - i) * min(lcp_next[i..j-1])` where `lcp_next`
/// holds adjacent longest-common-prefix lengths; singletons save nothing. A reverse dynamic
/// program picks block boundaries maximizing total savings, breaking ties in favor of fewer
/// (longer) blocks.
pub fn compress_blocks(pairs: &[Pair]) -> (Vec<Vec<u8>>, Vec<DataBlock>) {
    let count = pairs.len();
    if count == 0 {
        return (Vec::new(), Vec::new());
    }

    // Precompute adjacent LCPs: lcp_next[i] = LCP(keys[i], keys[i+1]).
    let lcp_next: Vec<usize> =
        (0..count - 1).map(|i| lcp_len(&pairs[i].0, &pairs[i + 1].0)).collect();

    // dp_save[i] is the best savings from i to the end; dp_blocks[i] the fewest blocks that
    // achieve it; end[i] the chosen last index of the block starting at i.
    let mut dp_save = vec![0i64; count + 1];
    let mut dp_blocks = vec![0usize; count + 1];
    let mut end = vec![0usize; count];

    for i in (0..count).rev() {
        let mut best_save = -1i64;
        let mut best_blocks = usize::MAX;
        let mut best_j = i;

        // Running minimum of lcp_next over the candidate block.
        let mut min_lcp = usize::MAX;
        for j in i..count {
            let block_save = if j == i {
                0
            } else {
                min_lcp = min_lcp.min(lcp_next[j - 1]);
                ((j - i) * min_lcp) as i64
            };
            let cand_save = block_save + dp_save[j + 1];
            let cand_blocks = 1 + dp_blocks[j + 1];
            if cand_save > best_save || (cand_save == best_save && cand_blocks < best_blocks) {
                best_save = cand_save;
                best_blocks = cand_blocks;
                best_j = j;
            }
        }
        dp_save[i] = best_save;
        dp_blocks[i] = best_blocks;
        end[i] = best_j;
    }

    // Reconstruct the chosen blocks, stripping each block's prefix from its keys.
    let mut prefixes = Vec::new();
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < count {
        let j = end[i];
        let prefix_len =
            if j > i { lcp_next[i..j].iter().copied().min().unwrap_or(0) } else { 0 };
        prefixes.push(pairs[i].0[..prefix_len].to_vec());

        let mut block = DataBlock {
            keys: Vec::with_capacity(j - i + 1),
            values: Vec::with_capacity(j - i + 1),
        };
        for (key, value) in &pairs[i..=j] {
            block.keys.push(key[prefix_len..].to_vec());
            block.values.push(value.clone());
        }
        blocks.push(block);
        i = j + 1;
    }

    (prefixes, blocks)
}
