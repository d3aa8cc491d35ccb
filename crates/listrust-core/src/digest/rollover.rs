//! Digest volume and issue rollover

use chrono::{DateTime, Datelike, Utc};
use listrust_common::types::DigestFrequency;
use listrust_common::Result;
use listrust_storage::MailingList;

/// Period bucket of `at` for the given frequency; buckets only grow with time
fn bucket(frequency: DigestFrequency, at: &DateTime<Utc>) -> i64 {
    let year = at.year() as i64;
    match frequency {
        DigestFrequency::Yearly => year,
        DigestFrequency::Monthly => year * 100 + at.month() as i64,
        DigestFrequency::Quarterly => year * 100 + (at.month() as i64 - 1) / 4,
        DigestFrequency::Weekly => year * 100 + at.iso_week().week() as i64,
        DigestFrequency::Daily => at.num_days_from_ce() as i64,
    }
}

/// Advance the list's digest counters for a digest sent at `now`
///
/// Starts a new volume (issue 1) when `now` falls in a later period than the
/// last digest, otherwise moves to the next issue. The first digest ever sent
/// never starts a new volume. An unrecognized frequency is a
/// `FatalConfiguration` error and leaves the list untouched.
pub fn bump_digest_number_and_volume(list: &mut MailingList, now: DateTime<Utc>) -> Result<()> {
    let frequency = list.digest_frequency()?;

    let bump = match list.digest_last_sent_at {
        None => false,
        Some(last) => bucket(frequency, &now) > bucket(frequency, &last),
    };

    if bump {
        list.volume += 1;
        list.next_digest_number = 1;
    } else {
        list.next_digest_number += 1;
    }
    list.digest_last_sent_at = Some(now);

    Ok(())
}
