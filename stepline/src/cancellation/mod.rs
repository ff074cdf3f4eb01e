//! Cooperative cancellation.
//!
//! One [`CancellationToken`] per run stops further dispatch; a second one
//! per run aborts in-flight siblings when the parallel failure policy asks
//! for it.

mod token;

pub use token::CancellationToken;
