/// Proptest strategies for protocol inputs

use proptest::prelude::*;

/// Cluster shape `(n, f)` with `n >= 2f + 1`
pub fn cluster_shape() -> impl Strategy<Value = (u32, u32)> {
    (0u32..=3).prop_flat_map(|f| ((2 * f + 1)..=(2 * f + 4)).prop_map(move |n| (n, f)))
}

/// Non-empty operation payload
pub fn operation() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..48)
}

/// A batch of operations for one client
pub fn operation_batch(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(operation(), 1..=max)
}

/// Seed for one shuffled delivery order
pub fn delivery_seed() -> impl Strategy<Value = u64> {
    any::<u64>()
}
