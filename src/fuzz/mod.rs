//! Fuzz-target lifecycle and log handling.

pub mod fuzzer;
pub mod log;

pub use fuzzer::{Fuzzer, FuzzerError, StopAction};

/// Name prefixes the fuzzing engine uses for saved failing inputs. Any
/// file under the data namespace carrying one of these is an artifact to
/// bring home, never corpus.
pub const ARTIFACT_PREFIXES: [&str; 6] =
    ["crash", "leak", "mismatch", "oom", "slow-unit", "timeout"];

pub fn is_artifact(name: &str) -> bool {
    ARTIFACT_PREFIXES.iter().any(|p| name.starts_with(p))
}
