//! m estimation from a ground-truth label column.
//!
//! Two records sharing a label are the same entity, so the distribution of
//! comparison vector values over those pairs estimates m directly. The
//! pairs are scored with a posterior of one and counted with the same
//! statement EM uses.

use crate::vectors::COMPARISON_VECTORS;

pub const DESCRIPTION: &str = "estimate m from label column";

/// Blocking rule selecting the pairs that share a label.
pub fn label_blocking_rule(label_column: &str) -> String {
    format!("l.{label_column} = r.{label_column}")
}

/// Comparison vectors scored as certain matches.
pub fn certain_match_scores_sql() -> String {
    format!(
        "select *, cast(1.0 as float8) as match_probability, 1 as match_count \
         from {COMPARISON_VECTORS}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_pairs_are_certain_matches() {
        assert_eq!(label_blocking_rule("cluster"), "l.cluster = r.cluster");
        assert_eq!(
            certain_match_scores_sql(),
            "select *, cast(1.0 as float8) as match_probability, 1 as match_count \
             from __reclink__df_comparison_vectors"
        );
    }
}
