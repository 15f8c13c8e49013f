use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde_json::json;
use time::OffsetDateTime;
use wreq::Method;

use crate::client::{CallError, UpstreamClient};

const SET_BIRTH_PATH: &str = "/rest/auth/set-birth-date";

impl UpstreamClient {
    /// Set a plausible adult birth date on the account.
    ///
    /// The upstream rejects or silently ignores the content-mode feature
    /// flip on accounts that never set one, so this always precedes
    /// [`UpstreamClient::enable_content_mode`]. Accepts 200 and 204.
    pub async fn set_birth_date(&self, token_id: &str) -> Result<(), CallError> {
        let mut headers = crate::headers::request_headers(self.config(), token_id, SET_BIRTH_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        headers.push((
            "referer".to_string(),
            format!("{}/?_s=home", self.base_url()),
        ));
        let body = json!({
            "birthDate": random_birth_date(OffsetDateTime::now_utc()),
        });
        let url = format!("{}{SET_BIRTH_PATH}", self.base_url());
        self.send(
            Method::POST,
            &url,
            headers,
            Some(Bytes::from(body.to_string())),
            Some(token_id),
            Duration::from_secs(30),
            false,
        )
        .await?;
        Ok(())
    }
}

/// Random birth date 20 to 48 years back, day capped at 28 so every month
/// is valid, with a jittered time-of-day so a batch over the pool doesn't
/// submit one identical value for every account.
fn random_birth_date(now: OffsetDateTime) -> String {
    let mut rng = rand::thread_rng();
    let year = now.year() - rng.gen_range(20..=48);
    let month = rng.gen_range(1..=12);
    let day = rng.gen_range(1..=28);
    let hour = rng.gen_range(0..24);
    let minute = rng.gen_range(0..60);
    let second = rng.gen_range(0..60);
    let millis = rng.gen_range(0..1000);
    format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn birth_date_shape_and_adult_range() {
        let now = datetime!(2026-08-02 12:00:00 UTC);
        for _ in 0..32 {
            let value = random_birth_date(now);
            assert_eq!(value.len(), "1990-01-01T00:00:00.000Z".len());
            assert_eq!(&value[4..5], "-");
            assert_eq!(&value[10..11], "T");
            assert!(value.ends_with('Z'));

            let year: i32 = value[..4].parse().unwrap();
            assert!((1978..=2006).contains(&year), "year {year} out of range");
            let day: u8 = value[8..10].parse().unwrap();
            assert!((1..=28).contains(&day));
        }
    }
}
