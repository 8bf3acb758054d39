//! Hierarchical group addressing
//!
//! Validators sorted by public key get a rank `1..=N`. The rank is written in
//! a mixed radix of `base` with `depth` digits; each node talks to the nodes
//! that differ from it in exactly one digit. Any two nodes are then at most
//! `depth` hops apart while each node keeps at most `depth * (base - 1)` peers.

use crate::types::{LedgerParameters, ValidatorNode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Largest supported validator population
pub const MAX_PARTICIPANTS: u64 = 1_000_000_000;

/// Deepest hierarchy the shape search may reach
pub const MAX_DEPTH: u32 = 60;

/// Digits of a hierarchical address, least significant first
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub Vec<u32>);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, digit) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", digit)?;
        }
        Ok(())
    }
}

/// Radix and digit count of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupShape {
    /// Radix
    pub base: u32,
    /// Number of digits
    pub depth: u32,
}

impl GroupShape {
    /// Upper bound on the number of peers of one node
    pub fn max_degree(&self) -> u64 {
        u64::from(self.depth) * u64::from(self.base.saturating_sub(1))
    }
}

/// `base^exp >= target`, without overflowing
fn pow_reaches(base: u64, exp: u32, target: u64) -> bool {
    let mut acc: u128 = 1;
    for _ in 0..exp {
        acc *= u128::from(base);
        if acc >= u128::from(target) {
            return true;
        }
    }
    acc >= u128::from(target)
}

/// Smallest integer `x` with `x^depth >= n`
fn ceil_root(n: u64, depth: u32) -> u64 {
    if n <= 1 || depth == 0 {
        return n;
    }
    let mut x = (n as f64).powf(1.0 / f64::from(depth)).ceil() as u64;
    x = x.max(1);
    // Float rounding can land one off either way
    while x > 1 && pow_reaches(x - 1, depth, n) {
        x -= 1;
    }
    while !pow_reaches(x, depth, n) {
        x += 1;
    }
    x
}

/// Estimated peer count at `depth`
fn connections(n: u64, depth: u32) -> u64 {
    u64::from(depth) * (ceil_root(n, depth) - 1)
}

/// Choose `(base, depth)` for `participants` nodes under a degree bound
///
/// Depth grows while that keeps reducing the peer count and the bound is not
/// yet met. A non-positive bound or a population under the bound gives one
/// flat group. The search starts from a flat cost of `3 * (n - 1)`, so a
/// population at or just above the bound already splits into two levels.
pub fn compute_group_shape(participants: u64, max_degree: i64) -> Result<GroupShape> {
    if participants == 0 {
        return Ok(GroupShape { base: 0, depth: 0 });
    }
    if participants > MAX_PARTICIPANTS {
        return Err(Error::Configuration(format!(
            "{} participants exceeds the supported maximum of {}",
            participants, MAX_PARTICIPANTS
        )));
    }
    if max_degree <= 0 || participants < max_degree as u64 {
        return Ok(GroupShape {
            base: participants as u32,
            depth: 1,
        });
    }

    let bound = max_degree as u64;
    let mut depth = 1u32;
    let mut current = (participants - 1) * 3;
    while current > bound {
        let next = depth + 1;
        if next > MAX_DEPTH {
            return Err(Error::Configuration(format!(
                "group shape search for {} participants did not converge below depth {}",
                participants, MAX_DEPTH
            )));
        }
        let estimate = connections(participants, next);
        if estimate >= current {
            break;
        }
        depth = next;
        current = estimate;
    }

    Ok(GroupShape {
        base: ceil_root(participants, depth) as u32,
        depth,
    })
}

/// Address of the node with 1-based `rank`
pub fn address_of(rank: u64, shape: GroupShape) -> Address {
    if shape.base <= 1 {
        return Address(vec![0]);
    }
    let base = u64::from(shape.base);
    let mut remaining = rank.saturating_sub(1);
    let mut digits = Vec::with_capacity(shape.depth as usize);
    for _ in 0..shape.depth {
        digits.push((remaining % base) as u32);
        remaining /= base;
    }
    Address(digits)
}

/// Inverse of [`address_of`]
pub fn rank_of(address: &Address, shape: GroupShape) -> u64 {
    let base = u64::from(shape.base.max(1));
    address
        .0
        .iter()
        .rev()
        .fold(0u64, |acc, digit| acc * base + u64::from(*digit))
        + 1
}

/// Nodes differing from `own` in exactly one digit
pub fn peers_of<'a>(nodes: &'a [ValidatorNode], own: &Address, shape: GroupShape) -> Vec<&'a ValidatorNode> {
    let mut wanted: HashSet<Address> = HashSet::new();
    for position in 0..own.0.len() {
        for digit in 0..shape.base {
            if digit == own.0[position] {
                continue;
            }
            let mut neighbour = own.clone();
            neighbour.0[position] = digit;
            wanted.insert(neighbour);
        }
    }
    nodes.iter().filter(|n| wanted.contains(&n.address)).collect()
}

/// Sort by public key, drop duplicate keys, then give every node its address
pub fn assign_addresses(mut nodes: Vec<ValidatorNode>, params: &LedgerParameters) -> Result<Vec<ValidatorNode>> {
    nodes.sort_by(|a, b| a.public_key.cmp(&b.public_key));
    nodes.dedup_by(|a, b| a.public_key == b.public_key);

    let shape = params.group_shape(nodes.len())?;
    for (index, node) in nodes.iter_mut().enumerate() {
        node.address = address_of(index as u64 + 1, shape);
    }
    Ok(nodes)
}
