//! Fuzz target for public key text decoding.
//!
//! Run with: cargo +nightly fuzz run fuzz_pubkey_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use whackctl_core::message::PubkeyAlg;
use whackctl_core::pubkey;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = pubkey::decode(PubkeyAlg::Rsa, s);
        let _ = pubkey::decode(PubkeyAlg::Raw, s);
    }
});
