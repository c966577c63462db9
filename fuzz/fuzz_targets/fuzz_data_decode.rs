// Run locally (from the repo root):
//   cargo +nightly fuzz run fuzz_data_decode -- -runs=1000
#![no_main]

use brew_cache::{data_codec, image_codec, DataKind};
use libfuzzer_sys::fuzz_target;
use serde::Deserialize;

const MAX_INPUT_SIZE: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Category {
    id: String,
    title: String,
    position: u32,
    tags: Vec<String>,
}

fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len().min(MAX_INPUT_SIZE)];

    // Oracle: malformed payloads must decode to an error, never panic or over-allocate.
    for kind in DataKind::ALL {
        let _ = data_codec::decode::<Vec<Category>>(kind, data);
        let _ = data_codec::decode::<Vec<(String, u64)>>(kind, data);
    }
    let _ = image_codec::decompress(data);
});
