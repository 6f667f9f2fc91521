use sha2::{Digest, Sha256};

/// Hash one payload leaf.
pub(crate) fn hash_leaf(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn combine(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root of a binary hash tree over `leaves`.
///
/// Odd levels duplicate their last node, so a single-leaf tree has the
/// stable shape `H(leaf ‖ leaf)`. The empty tree hashes the empty string.
pub(crate) fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return hash_leaf(b"");
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    loop {
        if level.len() % 2 != 0 {
            let last = *level.last().expect("level is non-empty");
            level.push(last);
        }
        level = level.chunks(2).map(|pair| combine(&pair[0], &pair[1])).collect();
        if level.len() == 1 {
            return level[0];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_hashes_empty_string() {
        assert_eq!(merkle_root(&[]), hash_leaf(b""));
    }

    #[test]
    fn single_leaf_duplicates_to_stable_shape() {
        let leaf = hash_leaf(b"only");
        assert_eq!(merkle_root(&[leaf]), combine(&leaf, &leaf));
    }

    #[test]
    fn odd_level_duplicates_last_leaf() {
        let a = hash_leaf(b"a");
        let b = hash_leaf(b"b");
        let c = hash_leaf(b"c");
        let expected = combine(&combine(&a, &b), &combine(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn any_leaf_change_alters_the_root() {
        let leaves: Vec<[u8; 32]> =
            (0u8..6).map(|n| hash_leaf(&[n])).collect();
        let baseline = merkle_root(&leaves);
        for position in 0..leaves.len() {
            let mut mutated = leaves.clone();
            mutated[position] = hash_leaf(b"tampered");
            assert_ne!(merkle_root(&mutated), baseline, "leaf {position}");
        }
    }
}
