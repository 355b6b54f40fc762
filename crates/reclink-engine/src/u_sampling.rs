//! u estimation from a random sample of record pairs.
//!
//! Almost every pair in a random sample is a non-match, so the distribution
//! of comparison vector values over a cartesian sample estimates u directly.
//! The sample is scored with a posterior of zero and counted with the same
//! statement EM uses.

use reclink_model::LinkType;

use crate::concat::CONCAT_WITH_TF;
use crate::vectors::COMPARISON_VECTORS;

pub const CONCAT_COUNT: &str = "__reclink__df_concat_count";
pub const CONCAT_SAMPLE: &str = "__reclink__df_concat_with_tf_sample";

pub const DESCRIPTION: &str = "estimate u by random sampling";

pub fn count_rows_sql() -> String {
    format!("select count(*) as count from {CONCAT_WITH_TF}")
}

/// Records needed so that comparing them all yields about `max_pairs` pairs.
pub fn sample_size(link_type: LinkType, max_pairs: f64) -> f64 {
    match link_type {
        // n(n-1)/2 = max_pairs
        LinkType::DedupeOnly | LinkType::LinkAndDedupe => (1.0 + (1.0 + 8.0 * max_pairs).sqrt()) / 2.0,
        // (n/2)^2 = max_pairs, assuming two equally sized sources
        LinkType::LinkOnly => 2.0 * max_pairs.sqrt(),
    }
}

/// Share of the `row_count` records to keep, at most 1.
pub fn sample_proportion(link_type: LinkType, max_pairs: f64, row_count: u64) -> f64 {
    if row_count == 0 {
        return 1.0;
    }
    (sample_size(link_type, max_pairs) / row_count as f64).min(1.0)
}

/// `select * from <concat_with_tf> <sampling clause>`
pub fn sample_sql(sampling_clause: &str) -> String {
    if sampling_clause.is_empty() {
        format!("select * from {CONCAT_WITH_TF}")
    } else {
        format!("select * from {CONCAT_WITH_TF} {sampling_clause}")
    }
}

/// Comparison vectors scored as certain non-matches.
pub fn non_match_scores_sql() -> String {
    format!(
        "select *, cast(0.0 as float8) as match_probability, 1 as match_count \
         from {COMPARISON_VECTORS}"
    )
}
