//! # Gossip Group Sizing
//!
//! New-block notifications go to a random subset of connected peers rather
//! than all of them. The subset is sized so that, if every contacted peer
//! relays with probability [`GOSSIP_PEER_SUCCESS_PROBABILITY`], the whole
//! network hears about the block with probability at least
//! [`GOSSIP_TARGET_REACH`].
//!
//! For `n` peers the per-hop target is `1 - (1 - 0.99)^(100/n)`, and the
//! number of peers needed to hit it is
//!
//! ```text
//! k = ceil( ln(1 - target) / ln(1 - p) ) = ceil( (100/n) * ln(0.01) / ln(0.49) )
//! ```
//!
//! Small networks (`n <= 25`) skip the maths and gossip to everyone.

use rand::seq::SliceRandom;

use crate::config::{
    GOSSIP_FULL_FANOUT_MAX_PEERS, GOSSIP_PEER_SUCCESS_PROBABILITY, GOSSIP_TARGET_REACH,
};

/// How many of `n` connected peers receive a gossip message.
pub fn gossip_fanout(n: usize) -> usize {
    if n <= GOSSIP_FULL_FANOUT_MAX_PEERS {
        return n;
    }
    let per_hop_failure = (1.0 - GOSSIP_TARGET_REACH).powf(100.0 / n as f64);
    let k = (per_hop_failure.ln() / (1.0 - GOSSIP_PEER_SUCCESS_PROBABILITY).ln()).ceil();
    (k as usize).clamp(1, n)
}

/// Pick the gossip group: everyone for small sets, otherwise a uniform
/// sample without replacement.
pub fn select_gossip_group<T: Clone>(peers: &[T]) -> Vec<T> {
    let k = gossip_fanout(peers.len());
    if k >= peers.len() {
        return peers.to_vec();
    }
    peers
        .choose_multiple(&mut rand::thread_rng(), k)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn small_networks_gossip_to_everyone() {
        assert_eq!(gossip_fanout(0), 0);
        assert_eq!(gossip_fanout(1), 1);
        assert_eq!(gossip_fanout(25), 25);
    }

    #[test]
    fn fanout_matches_reach_formula() {
        assert_eq!(gossip_fanout(26), 25);
        assert_eq!(gossip_fanout(100), 7);
        assert_eq!(gossip_fanout(1000), 1);
    }

    #[test]
    fn fanout_never_exceeds_peer_count() {
        for n in 0..500 {
            let k = gossip_fanout(n);
            assert!(k <= n, "n={n} k={k}");
            if n > 0 {
                assert!(k >= 1);
            }
        }
    }

    #[test]
    fn sample_has_no_duplicates() {
        let peers: Vec<u32> = (0..100).collect();
        let group = select_gossip_group(&peers);
        assert_eq!(group.len(), 7);
        let unique: HashSet<_> = group.iter().collect();
        assert_eq!(unique.len(), group.len());
    }

    #[test]
    fn small_sample_is_whole_set() {
        let peers = vec!["a", "b", "c"];
        assert_eq!(select_gossip_group(&peers), peers);
    }
}
