//! Two distinct randomness needs: a single process-wide RNG for picks that don't
//! need to vary per mobile (variant selection, greeting selection, rotation shuffle),
//! and a per-mobile reproducible shuffle seeded from a hash of the mobile string, so
//! `fetch_dialogs` visits channels in a different but reproducible order per session.
//! Both are seedable so tests can pin their output.

use std::sync::{Mutex, OnceLock};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

static SHARED_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

/// Process-wide RNG for indifferent picks. Seeded from OS entropy on first use;
/// call `seed_shared` (tests only) to pin it to a known sequence.
pub fn shared_rng() -> &'static Mutex<StdRng> {
    SHARED_RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

#[cfg(test)]
pub fn seed_shared(seed: u64) {
    *shared_rng().lock().unwrap() = StdRng::seed_from_u64(seed);
}

/// The classic `h = ((h << 5) - h) + ch` string hash, applied over bytes.
pub fn seed_from_str(s: &str) -> u64 {
    let mut h: i32 = 0;
    for ch in s.bytes() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(ch as i32);
    }
    h as u32 as u64
}

pub fn mobile_rng(mobile: &str) -> StdRng {
    StdRng::seed_from_u64(seed_from_str(mobile))
}

pub fn shuffle<T>(rng: &mut StdRng, items: &mut [T]) {
    items.shuffle(rng);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn seed_is_deterministic_per_mobile() {
        assert_eq!(seed_from_str("15551234567"), seed_from_str("15551234567"));
        assert_ne!(seed_from_str("15551234567"), seed_from_str("15559876543"));
    }

    #[test]
    fn shuffle_is_reproducible_for_same_seed() {
        let mut a: Vec<i32> = (0..20).collect();
        let mut b = a.clone();
        shuffle(&mut mobile_rng("m1"), &mut a);
        shuffle(&mut mobile_rng("m1"), &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn shared_rng_is_reproducible_once_seeded() {
        seed_shared(42);
        let a: u32 = shared_rng().lock().unwrap().gen_range(0..1_000_000);
        seed_shared(42);
        let b: u32 = shared_rng().lock().unwrap().gen_range(0..1_000_000);
        assert_eq!(a, b);
    }
}
