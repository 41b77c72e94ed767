#![forbid(unsafe_code)]

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Deterministic hex digest of a fixture's JSON encoding, used to tie test
/// results back to the exact inputs they ran against.
pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Property-test case count: `PW_PROPTEST_CASES` wins, CI gets a deeper
/// default, local runs stay fast.
#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("PW_PROPTEST_CASES") {
        if let Ok(parsed) = raw.parse::<u32>() {
            if parsed > 0 {
                return parsed;
            }
        }
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

/// Explicit reproduction seed, if one was pinned via `PW_PROPTEST_SEED` or
/// proptest's own `PROPTEST_RNG_SEED`.
#[must_use]
pub fn pinned_proptest_seed() -> Option<u64> {
    for var in ["PW_PROPTEST_SEED", "PROPTEST_RNG_SEED"] {
        if let Ok(raw) = std::env::var(var) {
            if let Ok(seed) = raw.parse::<u64>() {
                return Some(seed);
            }
        }
    }
    None
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}
