//! Environment abstraction for deterministic testing.
//!
//! Decouples service logic from system resources (time, randomness).
//! Enables deterministic tests with virtual clocks and seeded randomness,
//! and production use with real system resources.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now_millis()` never goes backwards within a single execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time in milliseconds since the Unix epoch.
    ///
    /// # Invariants
    ///
    /// - Subsequent calls must return values >= previous calls. Records
    ///   persisted with these timestamps rely on monotonic ordering.
    fn now_millis(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait. Service logic uses it
    /// for retry backoff and the anonymization layer's randomized delay.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same seed, a test environment produces the same sequence
    /// - Production implementations use a cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Convenience for identifiers that must be unpredictable, like case
    /// IDs and routing aliases.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Useful for key IDs and message IDs.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// Generates a random 32-byte array.
    ///
    /// Sized for key entropy and seal nonce material.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Production environment using system time and cryptographic RNG.
///
/// Uses `std::time::SystemTime` for wall-clock time, `tokio::time::sleep`
/// for async sleeping, and getrandom for cryptographic randomness.
///
/// # Security
///
/// The RNG uses getrandom which provides OS-level cryptographic randomness
/// (e.g., /dev/urandom on Linux, `BCryptGenRandom` on Windows). Suitable
/// for generating key entropy, nonces, case IDs, and routing aliases.
///
/// # Panics
///
/// Panics if the OS RNG fails. This is intentional - a service without
/// functioning cryptographic randomness cannot operate securely, and
/// continuing would compromise every key and identifier it produces.
#[derive(Clone, Default)]
pub struct SystemEnv {
    /// Highest timestamp handed out so far, to hold the monotonicity
    /// invariant across small system clock steps.
    high_water: Arc<AtomicU64>,
}

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for SystemEnv {
    fn now_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        self.high_water.fetch_max(now, Ordering::Relaxed).max(now)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("OS RNG failure: cannot operate without secure randomness");
    }
}

/// Deterministic environment for tests.
pub mod test_utils {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use super::Environment;

    /// Test environment with a settable virtual clock, a deterministic
    /// byte generator, and an instant sleep.
    ///
    /// Entropy is derived from a monotonically increasing draw counter,
    /// mixed so every draw is distinct and never all-zero. Deterministic,
    /// not secure; never use outside tests.
    #[derive(Clone)]
    pub struct MockEnv {
        now: Arc<AtomicU64>,
        counter: Arc<AtomicU64>,
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockEnv {
        /// Create a mock environment at a fixed mid-2023 epoch.
        #[must_use]
        pub fn new() -> Self {
            Self {
                now: Arc::new(AtomicU64::new(1_700_000_000_000)),
                counter: Arc::new(AtomicU64::new(1)),
            }
        }

        /// Advance the virtual clock.
        pub fn advance(&self, duration: Duration) {
            self.now.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Environment for MockEnv {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let draw = self.counter.fetch_add(1, Ordering::SeqCst);
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (draw as u8)
                    .wrapping_mul(59)
                    .wrapping_add((i as u8).wrapping_mul(11))
                    .wrapping_add((draw >> 8) as u8)
                    | 1;
            }
        }
    }
}
