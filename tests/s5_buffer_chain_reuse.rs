//! S5 — repeatedly adding and fully draining a buffer doesn't grow its
//! block chain without bound.

use cycle_io::{Buffer, BufferConfig};

#[test]
fn add_then_drain_twice_keeps_the_chain_small() {
    let config = BufferConfig {
        min_block_size: 4096,
        realign_threshold: 2048,
        max_reserve_blocks: 16,
    };
    let mut buf = Buffer::with_config(config);

    let chunk = vec![0u8; 5000];

    buf.add(&chunk);
    assert_eq!(buf.len(), 5000);
    buf.drain(5000);
    assert_eq!(buf.len(), 0);
    // One 8192-byte block (the round-up of 5000) gets recycled rather than
    // freed, so there's at most that one block in the chain.
    assert!(buf.block_count() <= 2);

    buf.add(&chunk);
    assert_eq!(buf.len(), 5000);
    buf.drain(5000);
    assert_eq!(buf.len(), 0);
    assert!(buf.block_count() <= 2);
    assert!(buf.block_count() < config.max_reserve_blocks);
}
