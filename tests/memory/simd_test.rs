/*!
 * SIMD Operation Tests
 * Vectorized copy, fill and compare agree with the plain slice operations
 */

use memory_core::memory::numa::NumaTopology;
use memory_core::memory::simd::{
    capabilities, first_difference, simd_memcmp, simd_memcpy, simd_memset, simd_zero,
};
use memory_core::{ManagerConfig, MemoryManager, MemoryPolicy};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;

#[test]
fn test_large_copy_with_unaligned_offsets() {
    let src: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
    let mut dst = vec![0u8; 10_003];

    let copied = simd_memcpy(&mut dst[3..], &src[1..]);
    assert_eq!(copied, 9_999);
    assert_eq!(&dst[3..10_002], &src[1..]);
    assert_eq!(dst[..3], [0, 0, 0]);
}

#[test]
fn test_fill_and_zero() {
    let mut buffer = vec![1u8; 4099];
    assert_eq!(simd_memset(&mut buffer, 0xEE), 4099);
    assert!(buffer.iter().all(|&b| b == 0xEE));

    simd_zero(&mut buffer[17..]);
    assert!(buffer[..17].iter().all(|&b| b == 0xEE));
    assert!(buffer[17..].iter().all(|&b| b == 0));
}

#[test]
fn test_difference_past_first_vector() {
    let a = vec![9u8; 1000];
    let mut b = a.clone();
    b[777] = 10;

    assert_eq!(first_difference(&a, &b), Some(777));
    assert_eq!(simd_memcmp(&a, &b), Ordering::Less);
    assert_eq!(simd_memcmp(&a, &a[..999]), Ordering::Greater);
    assert!(capabilities().vector_bytes() >= 8);
}

#[test]
fn test_manager_operations_feed_bandwidth() {
    let config =
        ManagerConfig::compact().with_numa_topology(Arc::new(NumaTopology::single_node()));
    let mgr = MemoryManager::new(config).unwrap();
    let policy = MemoryPolicy::default();

    let src = vec![3u8; 8192];
    let mut dst = vec![0u8; 8192];
    assert_eq!(mgr.copy_memory(&mut dst, &src, &policy), 8192);
    assert_eq!(mgr.compare_memory(&dst, &src, &policy), Ordering::Equal);

    let mut buffer: Vec<u8> = (0..16).collect();
    assert_eq!(mgr.move_memory(&mut buffer, 0..8, 4), 8);
    assert_eq!(&buffer[4..12], &[0, 1, 2, 3, 4, 5, 6, 7]);

    assert_eq!(mgr.zero_memory(&mut dst, &policy.clone().with_simd(false)), 8192);
    assert_eq!(mgr.compare_memory(&dst, &src, &policy), Ordering::Less);
}

proptest! {
    #[test]
    fn prop_copy_matches_slice_copy(
        src in proptest::collection::vec(any::<u8>(), 0..600),
        pad in 0usize..40,
    ) {
        let mut dst = vec![0xAAu8; src.len() + pad];
        let copied = simd_memcpy(&mut dst, &src);
        prop_assert_eq!(copied, src.len());
        prop_assert_eq!(&dst[..src.len()], &src[..]);
        prop_assert!(dst[src.len()..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn prop_compare_matches_slice_cmp(
        a in proptest::collection::vec(0u8..4, 0..300),
        b in proptest::collection::vec(0u8..4, 0..300),
    ) {
        prop_assert_eq!(simd_memcmp(&a, &b), a.cmp(&b));
        let expected = a.iter().zip(&b).position(|(x, y)| x != y);
        prop_assert_eq!(first_difference(&a, &b), expected);
    }

    #[test]
    fn prop_fill_sets_every_byte(len in 0usize..2000, value in any::<u8>()) {
        let mut buffer = vec![!value; len];
        prop_assert_eq!(simd_memset(&mut buffer, value), len);
        prop_assert!(buffer.iter().all(|&b| b == value));
    }
}
