//! Node naming and ordinal allocation.
//!
//! Nodes are named `{network}-{ordinal}`. New ordinals are derived from the
//! names that currently exist, so no allocation state is kept anywhere:
//! the next ordinal is the highest existing ordinal plus one. Names are
//! compared in natural order (digit runs compared by value), so `net-10`
//! sorts after `net-9`.

use std::cmp::Ordering;

/// Width digit runs are padded to before comparison.
const NATURAL_PAD_WIDTH: usize = 9;

/// Derives the node id used in node data from a node name.
pub fn to_id(name: &str) -> String {
    name.to_lowercase()
}

/// Name of the first node of a network.
pub fn start_node_name(network: &str) -> String {
    node_name(network, 0)
}

/// Builds the name of the node with the given ordinal.
pub fn node_name(network: &str, ordinal: u64) -> String {
    format!("{network}-{ordinal}")
}

/// Name of the load balancer fronting a network.
pub fn load_balancer_name(network: &str) -> String {
    format!("lb-nw-{network}")
}

/// Subject alternative name nodes carry for the load balancer FQDN.
pub fn node_san(fqdn: &str) -> String {
    format!("dNSName:{fqdn}")
}

/// Parses the numeric suffix after the last `-` of a node name.
///
/// Returns `None` if the name has no `-` or the suffix is not a number.
pub fn ordinal(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

/// Pads every digit run to a fixed width so that lexical order matches
/// numeric order.
fn pad_digits(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + NATURAL_PAD_WIDTH);
    let mut digits = String::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if !digits.is_empty() {
            out.push_str(&format!("{digits:0>width$}", width = NATURAL_PAD_WIDTH));
            digits.clear();
        }
        out.push(c);
    }
    if !digits.is_empty() {
        out.push_str(&format!("{digits:0>width$}", width = NATURAL_PAD_WIDTH));
    }
    out
}

/// Compares two names in natural order.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    pad_digits(a).cmp(&pad_digits(b))
}

/// Computes the next free ordinal for a set of node names.
///
/// The name that sorts last in natural order determines the ordinal. An
/// empty set starts at zero. Names without a numeric suffix are ignored.
pub fn next_ordinal<'a, I>(names: I) -> u64
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter(|name| ordinal(name).is_some())
        .max_by(|a, b| natural_cmp(a, b))
        .and_then(ordinal)
        .map_or(0, |max| max + 1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_next_ordinal_skips_gaps() {
        assert_eq!(next_ordinal(["net-0", "net-3", "net-7"]), 8);
    }

    #[test]
    fn test_next_ordinal_is_numeric_not_lexical() {
        assert_eq!(next_ordinal(["net-9", "net-10"]), 11);
        assert_eq!(next_ordinal(["net-10", "net-9"]), 11);
    }

    #[test]
    fn test_next_ordinal_empty_set_starts_at_zero() {
        assert_eq!(next_ordinal(std::iter::empty()), 0);
    }

    #[test]
    fn test_next_ordinal_ignores_non_numeric_suffix() {
        assert_eq!(next_ordinal(["net-2", "net-backup"]), 3);
    }

    #[test]
    fn test_natural_cmp_orders_by_value() {
        assert_eq!(natural_cmp("net-9", "net-10"), Ordering::Less);
        assert_eq!(natural_cmp("net-10", "net-10"), Ordering::Equal);
        assert_eq!(natural_cmp("a2-net-1", "a10-net-1"), Ordering::Less);
    }

    #[test]
    fn test_network_names_containing_dashes() {
        assert_eq!(ordinal("my-test-net-4"), Some(4));
        assert_eq!(next_ordinal(["my-test-net-4", "my-test-net-12"]), 13);
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(start_node_name("prod"), "prod-0");
        assert_eq!(load_balancer_name("prod"), "lb-nw-prod");
        assert_eq!(node_san("lb.example.com"), "dNSName:lb.example.com");
        assert_eq!(to_id("Prod-3"), "prod-3");
    }

    proptest! {
        #[test]
        fn prop_next_ordinal_exceeds_every_existing(ordinals in proptest::collection::vec(0u64..100_000, 1..20)) {
            let names: Vec<String> = ordinals.iter().map(|o| node_name("net", *o)).collect();
            let next = next_ordinal(names.iter().map(String::as_str));
            prop_assert!(ordinals.iter().all(|o| *o < next));
            prop_assert_eq!(next, ordinals.iter().max().copied().unwrap() + 1);
        }
    }
}
