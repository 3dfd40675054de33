//! Correlation tokens for RPC.
//!
//! Tokens only need to be unique among in-flight requests, so they come from
//! a fast thread-local PRNG rather than a cryptographic source. 32
//! alphanumeric characters give ~190 bits of space.

use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

/// Length of generated correlation ids.
pub const CORRELATION_ID_LEN: usize = 32;

thread_local! {
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Generate a new 32-character correlation id.
pub fn new_correlation_id() -> String {
    RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        (0..CORRELATION_ID_LEN)
            .map(|_| char::from(rng.sample(Alphanumeric)))
            .collect()
    })
}

/// Generate a random 64-bit token.
pub fn generate_token() -> u64 {
    RNG.with(|rng| rng.borrow_mut().gen())
}
