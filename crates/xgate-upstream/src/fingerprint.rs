use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use xgate_common::UpstreamConfig;

use crate::emulation::fnv1a;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const LETTERS_DIGITS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Resolve the `x-statsig-id` anti-bot header for one request.
///
/// The static configured value is the supported path. With
/// `dynamic_statsig` the id is derived from `(token, minute bucket)`:
/// stable within the bucket so one token doesn't present a different id
/// on every request, and reproducible under test.
pub fn statsig_id(config: &UpstreamConfig, token_id: &str, now_unix: i64) -> Option<String> {
    if !config.dynamic_statsig {
        return config.statsig_id.clone().filter(|id| !id.is_empty());
    }

    let bucket = (now_unix / 60) as u64;
    let seed = fnv1a(token_id) ^ bucket.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut rng = StdRng::seed_from_u64(seed);

    // Two error-string shapes observed in the wild.
    let message = if rng.gen_bool(0.5) {
        let tail = random_string(&mut rng, LETTERS_DIGITS, 5);
        format!("e:TypeError: Cannot read properties of null (reading 'children['{tail}']')")
    } else {
        let tail = random_string(&mut rng, LETTERS, 10);
        format!("e:TypeError: Cannot read properties of undefined (reading '{tail}')")
    };
    Some(BASE64.encode(message))
}

fn random_string(rng: &mut StdRng, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dynamic: bool) -> UpstreamConfig {
        UpstreamConfig {
            statsig_id: Some("c3RhdGlj".to_string()),
            dynamic_statsig: dynamic,
            ..Default::default()
        }
    }

    #[test]
    fn static_value_wins_when_dynamic_off() {
        assert_eq!(
            statsig_id(&config(false), "tok", 0).as_deref(),
            Some("c3RhdGlj")
        );
    }

    #[test]
    fn missing_static_value_yields_none() {
        let mut cfg = config(false);
        cfg.statsig_id = None;
        assert!(statsig_id(&cfg, "tok", 0).is_none());
    }

    #[test]
    fn dynamic_is_stable_within_a_minute_bucket() {
        let cfg = config(true);
        let a = statsig_id(&cfg, "tok", 60).unwrap();
        let b = statsig_id(&cfg, "tok", 90).unwrap();
        let c = statsig_id(&cfg, "tok", 121).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dynamic_decodes_to_an_error_string() {
        let cfg = config(true);
        let id = statsig_id(&cfg, "tok", 0).unwrap();
        let decoded = BASE64.decode(id).unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.starts_with("e:TypeError: Cannot read properties of"));
    }
}
