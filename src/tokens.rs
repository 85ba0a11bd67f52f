//! Token counting with the cl100k BPE, the encoding every budget in the
//! model table is expressed in.

use std::sync::LazyLock;

use tiktoken_rs::{cl100k_base, CoreBPE};

static CL100K: LazyLock<CoreBPE> =
    LazyLock::new(|| cl100k_base().expect("cl100k_base ranks are embedded in tiktoken-rs"));

/// Number of cl100k tokens in `text`.
pub fn token_len(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    CL100K.encode_ordinary(text).len()
}
