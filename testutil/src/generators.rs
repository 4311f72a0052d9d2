/// Test data generators

use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct operations, tagged with their index so they
/// never collide
pub fn distinct_operations(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut op = format!("op-{}-", i).into_bytes();
            op.extend(random_bytes(8));
            op
        })
        .collect()
}
