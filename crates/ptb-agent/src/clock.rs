//! Clock-sync verification for `run_apps{t0, tcurrent}` (§4.9 step 11): the
//! Agent refuses to run the experiment if its own clock disagrees with the
//! Controller's `tcurrent` by more than a fixed tolerance.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Skew beyond which the Agent refuses `run_apps` outright.
pub const MAX_CLOCK_SKEW_SECS: i64 = 10;

pub fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parses both timestamps and returns the scheduled start instant `t0`,
/// bailing if the skew between this host's clock and the Controller's
/// `tcurrent` exceeds [`MAX_CLOCK_SKEW_SECS`].
pub fn verify_and_parse(t0: &str, tcurrent: &str) -> Result<DateTime<Utc>> {
    let t0: DateTime<Utc> = t0.parse::<DateTime<Utc>>().context("parsing t0")?.with_timezone(&Utc);
    let tcurrent: DateTime<Utc> = tcurrent
        .parse::<DateTime<Utc>>()
        .context("parsing tcurrent")?
        .with_timezone(&Utc);

    let skew = (Utc::now() - tcurrent).num_seconds().abs();
    if skew > MAX_CLOCK_SKEW_SECS {
        bail!("clock skew of {skew}s against Controller exceeds tolerance of {MAX_CLOCK_SKEW_SECS}s");
    }
    Ok(t0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_accepts_synced_clocks() {
        let now = Utc::now();
        let t0 = now + chrono::Duration::seconds(5);
        let parsed = verify_and_parse(&t0.to_rfc3339(), &now.to_rfc3339()).unwrap();
        assert_eq!(parsed.timestamp(), t0.timestamp());
    }

    #[test]
    fn test_verify_rejects_large_skew() {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(3600);
        let t0 = now + chrono::Duration::seconds(5);
        assert!(verify_and_parse(&t0.to_rfc3339(), &stale.to_rfc3339()).is_err());
    }
}
