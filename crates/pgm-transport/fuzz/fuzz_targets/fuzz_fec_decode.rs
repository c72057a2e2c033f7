#![no_main]

use libfuzzer_sys::fuzz_target;
use pgm_transport::codec::RsDecoder;

const K: usize = 4;
const H: usize = 2;

/// Splits arbitrary input into `(index, shard)` pairs for the original and
/// recovery sets, all shards padded to a common length, and feeds them to
/// the RS decoder. There is no valid/invalid precondition to uphold here
/// other than "never panic" — `RsDecoder::decode` is expected to reject
/// malformed combinations with an error instead.
fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    let shard_len = 1 + (data[0] as usize % 64);
    let chunks: Vec<&[u8]> = data[1..].chunks(shard_len.max(1)).collect();
    if chunks.is_empty() {
        return;
    }

    let mut originals = Vec::new();
    let mut recovery = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let mut shard = chunk.to_vec();
        shard.resize(shard_len, 0);
        if i % 2 == 0 {
            originals.push((i % K, shard));
        } else {
            recovery.push((i % H, shard));
        }
    }

    let decoder = RsDecoder::new(K, H);
    let _ = decoder.decode(&originals, &recovery);
});
