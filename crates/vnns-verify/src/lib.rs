// crates/vnns-verify/src/lib.rs
//
// vnns-verify: everything that talks to the verification network.
//
// A NetworkSession wraps one network connection. The registrar, submitter,
// tracker, and resolver are each constructed with that session (or with the
// tracker they share) and carry a submission from key registration through
// to a resolved statement path.

pub mod http;
pub mod local;
pub mod registrar;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod submitter;
pub mod tracker;

// Re-export key types for ergonomic access from downstream crates.
pub use http::HttpNetwork;
pub use local::LocalNetwork;
pub use registrar::VerificationKeyRegistrar;
pub use resolver::StatementPathResolver;
pub use retry::{Retry, RetryConfig, RetryResult};
pub use session::NetworkSession;
pub use submitter::{ProofSubmitter, SubmissionHandle};
pub use tracker::{AggregationTracker, TrackOutcome, TrackerConfig, TrackerUpdate};
