//! Comparison vectors and their aggregation into agreement patterns.

use reclink_model::Settings;

use crate::blocking::BLOCKED;

pub const COMPARISON_VECTORS: &str = "__reclink__df_comparison_vectors";
pub const AGREEMENT_PATTERNS: &str = "__reclink__agreement_pattern_counts";

/// Input columns read by any comparison, without the id columns.
pub(crate) fn matching_columns(settings: &Settings) -> Vec<String> {
    let reserved = [
        settings.unique_id_column_name(),
        settings.source_dataset_column_name(),
    ];
    let mut columns: Vec<String> = Vec::new();
    for column in settings.comparisons().iter().flat_map(|c| c.input_columns()) {
        let taken = reserved.iter().any(|r| r.eq_ignore_ascii_case(&column))
            || columns.iter().any(|c| c.eq_ignore_ascii_case(&column));
        if !taken {
            columns.push(column);
        }
    }
    columns
}

/// Retained columns that no comparison reads.
pub(crate) fn additional_columns(settings: &Settings) -> Vec<String> {
    let matching = matching_columns(settings);
    settings
        .columns_to_retain()
        .into_iter()
        .filter(|c| !matching.iter().any(|m| m.eq_ignore_ascii_case(c)))
        .collect()
}

pub(crate) fn pair_columns(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .flat_map(|c| [format!("{c}_l"), format!("{c}_r")])
        .collect()
}

/// One gamma column per comparison over the blocked pairs.
pub fn compute_comparison_vectors_sql(settings: &Settings) -> String {
    let mut select = pair_columns(&[
        settings.source_dataset_column_name().to_string(),
        settings.unique_id_column_name().to_string(),
    ]);
    if settings.retain_matching_columns() {
        select.extend(pair_columns(&matching_columns(settings)));
    }
    select.extend(settings.comparisons().iter().map(|c| c.case_statement()));
    let tf: Vec<String> = settings.tf_columns().iter().map(|c| format!("tf_{c}")).collect();
    select.extend(pair_columns(&tf));
    select.extend(pair_columns(&additional_columns(settings)));
    select.push("match_key".to_string());

    format!("select {} from {BLOCKED}", select.join(", "))
}

/// Count of each distinct combination of gamma values.
pub fn agreement_pattern_counts_sql(settings: &Settings) -> String {
    let gammas: Vec<String> = settings
        .comparisons()
        .iter()
        .map(|c| c.gamma_column_name())
        .collect();
    let gammas = gammas.join(", ");
    format!(
        "select {gammas}, count(*) as match_count from {COMPARISON_VECTORS} group by {gammas}"
    )
}
