//! 🪪 doc_id.rs: stable names for documents that will be written again tomorrow.
//!
//! 🎯 Same (family, metric, date bucket, repository) → same id, every call, every process,
//! every machine. That's the whole trick. Rerun the job twice and the store overwrites
//! instead of collecting duplicates like a junk drawer collects rubber bands.
//!
//! 🔐 SHA-256 over the four parts (joined with an ASCII unit separator so "a-b" + "c" never
//! collides with "a" + "b-c"), first 128 bits, dressed up as a v8 UUID.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use uuid::Uuid;

// -- ␟ ASCII unit separator. nobody puts this in a repo name. nobody.
const PART_SEPARATOR: u8 = 0x1f;

/// 📅 The time granularity baked into an id (and sometimes an index name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateBucket {
    /// `yyyy-MM-dd`
    Day(NaiveDate),
    /// `MM-yyyy`
    Month(NaiveDate),
}

impl DateBucket {
    /// 🔤 The string that goes into the hash and onto index names.
    pub fn render(&self) -> String {
        match self {
            DateBucket::Day(d) => d.format("%Y-%m-%d").to_string(),
            DateBucket::Month(d) => d.format("%m-%Y").to_string(),
        }
    }
}

impl std::fmt::Display for DateBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// 🪪 Derive the document id for a natural key.
///
/// Pure. No clock, no randomness, no globals. Lowercase hyphenated, always 36 chars.
pub fn doc_id(family: &str, metric_name: &str, bucket: DateBucket, repository: &str) -> String {
    let rendered_bucket = bucket.render();
    let mut hasher = Sha256::new();
    for (i, part) in [family, metric_name, rendered_bucket.as_str(), repository]
        .iter()
        .enumerate()
    {
        if i > 0 {
            hasher.update([PART_SEPARATOR]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut first_128_bits = [0u8; 16];
    first_128_bits.copy_from_slice(&digest[..16]);
    Uuid::new_v8(first_128_bits).hyphenated().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn the_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).expect("💀 March 7th exists. calendars agree.")
    }

    #[test]
    fn the_one_where_the_same_key_gets_the_same_id_forever() {
        let first = doc_id("general-metrics", "Open Issues", DateBucket::Day(the_day()), "alpha");
        let second = doc_id("general-metrics", "Open Issues", DateBucket::Day(the_day()), "alpha");
        assert_eq!(first, second);
        assert_eq!(first.len(), 36);
        assert_eq!(first, first.to_lowercase());
    }

    #[test]
    fn the_one_where_every_part_of_the_key_matters() {
        let the_baseline = doc_id("general-metrics", "Open Issues", DateBucket::Day(the_day()), "alpha");
        let tomorrow = the_day().succ_opt().expect("💀 tomorrow got cancelled");

        assert_ne!(the_baseline, doc_id("label-metrics", "Open Issues", DateBucket::Day(the_day()), "alpha"));
        assert_ne!(the_baseline, doc_id("general-metrics", "Closed Issues", DateBucket::Day(the_day()), "alpha"));
        assert_ne!(the_baseline, doc_id("general-metrics", "Open Issues", DateBucket::Day(tomorrow), "alpha"));
        assert_ne!(the_baseline, doc_id("general-metrics", "Open Issues", DateBucket::Day(the_day()), "beta"));
        assert_ne!(the_baseline, doc_id("general-metrics", "Open Issues", DateBucket::Month(the_day()), "alpha"));
    }

    #[test]
    fn the_one_where_shifting_a_dash_between_parts_does_not_collide() {
        let left = doc_id("a-b", "c", DateBucket::Day(the_day()), "r");
        let right = doc_id("a", "b-c", DateBucket::Day(the_day()), "r");
        assert_ne!(left, right);
    }

    #[test]
    fn the_one_where_buckets_render_like_the_index_names_expect() {
        assert_eq!(DateBucket::Day(the_day()).render(), "2024-03-07");
        assert_eq!(DateBucket::Month(the_day()).render(), "03-2024");
    }
}
