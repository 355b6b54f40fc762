//! Candidate pair generation.
//!
//! Each blocking rule becomes one join branch. A pair produced by an
//! earlier rule is excluded from every later branch, so the `UNION ALL` of
//! the branches holds each pair once, tagged with the index of the first
//! rule that found it (`match_key`).

use reclink_model::{LinkType, Settings};

pub const BLOCKED: &str = "__reclink__df_blocked";

/// `concat(x.source_dataset, '-__-', x.unique_id)`
fn composite_id(settings: &Settings, alias: &str) -> String {
    format!(
        "concat({alias}.{}, '-__-', {alias}.{})",
        settings.source_dataset_column_name(),
        settings.unique_id_column_name()
    )
}

/// `l.c as c_l, r.c as c_r` for ids, retained columns and tf columns.
fn select_columns(settings: &Settings) -> String {
    let mut columns: Vec<String> = vec![
        settings.source_dataset_column_name().to_string(),
        settings.unique_id_column_name().to_string(),
    ];
    columns.extend(settings.columns_to_retain());
    columns.extend(settings.tf_columns().iter().map(|c| format!("tf_{c}")));

    columns
        .iter()
        .map(|c| format!("l.{c} as {c}_l, r.{c} as {c}_r"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_condition(settings: &Settings) -> String {
    let mut condition = format!(
        "where {} < {}",
        composite_id(settings, "l"),
        composite_id(settings, "r")
    );
    if settings.link_type() == LinkType::LinkOnly {
        let sd = settings.source_dataset_column_name();
        condition.push_str(&format!(" and l.{sd} != r.{sd}"));
    }
    condition
}

/// Candidate pairs of `table` under `rules`, or every ordered pair when
/// `rules` is empty.
pub fn block_using_rules_sql(settings: &Settings, rules: &[String], table: &str) -> String {
    blocking_sql(settings, rules, table, table, &where_condition(settings))
}

/// Pairs of an existing record (`l`, from `existing`) and a new record
/// (`r`, from `new_records`) under `rules`.
///
/// Every such pair is a candidate whatever the link type; only a record
/// present on both sides is kept from pairing with itself.
pub fn block_new_records_sql(
    settings: &Settings,
    rules: &[String],
    existing: &str,
    new_records: &str,
) -> String {
    let condition = format!(
        "where {} != {}",
        composite_id(settings, "l"),
        composite_id(settings, "r")
    );
    blocking_sql(settings, rules, existing, new_records, &condition)
}

fn blocking_sql(settings: &Settings, rules: &[String], left: &str, right: &str, condition: &str) -> String {
    let columns = select_columns(settings);

    if rules.is_empty() {
        return format!(
            "select {columns}, '0' as match_key from {left} as l cross join {right} as r {condition}"
        );
    }

    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let previous = &rules[..i];
            let on = if previous.is_empty() {
                format!("({rule})")
            } else {
                let already: Vec<String> = previous
                    .iter()
                    .map(|p| format!("ifnull(({p}), false)"))
                    .collect();
                format!("({rule}) AND NOT ({})", already.join(" OR "))
            };
            format!(
                "select {columns}, '{i}' as match_key from {left} as l \
                 inner join {right} as r on {on} {condition}"
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclink_model::{ComparisonSpec, SettingsSpec};

    fn settings(link_type: LinkType, rules: &[&str]) -> Settings {
        let spec = SettingsSpec::new(link_type, vec![ComparisonSpec::exact_match("surname")])
            .with_blocking_rules(rules.iter().copied());
        Settings::from_spec(spec).unwrap()
    }

    #[test]
    fn single_rule_orders_pairs_by_composite_id() {
        let s = settings(LinkType::DedupeOnly, &["l.surname = r.surname"]);
        let sql = block_using_rules_sql(&s, s.blocking_rules(), "t");
        assert_eq!(
            sql,
            "select l.source_dataset as source_dataset_l, r.source_dataset as source_dataset_r, \
             l.unique_id as unique_id_l, r.unique_id as unique_id_r, \
             l.surname as surname_l, r.surname as surname_r, '0' as match_key \
             from t as l inner join t as r on (l.surname = r.surname) \
             where concat(l.source_dataset, '-__-', l.unique_id) < concat(r.source_dataset, '-__-', r.unique_id)"
        );
    }

    #[test]
    fn later_rules_exclude_earlier_matches_null_safely() {
        let s = settings(
            LinkType::DedupeOnly,
            &["l.surname = r.surname", "l.dob = r.dob", "l.city = r.city"],
        );
        let sql = block_using_rules_sql(&s, s.blocking_rules(), "t");
        let branches: Vec<&str> = sql.split(" UNION ALL ").collect();
        assert_eq!(branches.len(), 3);
        assert!(branches[1].contains("'1' as match_key"));
        assert!(branches[1]
            .contains("on (l.dob = r.dob) AND NOT (ifnull((l.surname = r.surname), false)) where"));
        assert!(branches[2].contains(
            "on (l.city = r.city) AND NOT (ifnull((l.surname = r.surname), false) OR ifnull((l.dob = r.dob), false))"
        ));
    }

    #[test]
    fn link_only_requires_distinct_sources() {
        let s = settings(LinkType::LinkOnly, &[]);
        let sql = block_using_rules_sql(&s, &[], "t");
        assert!(sql.contains("'0' as match_key from t as l cross join t as r"));
        assert!(sql.ends_with("and l.source_dataset != r.source_dataset"));
    }

    #[test]
    fn new_records_pair_with_every_existing_record_but_themselves() {
        let s = settings(LinkType::DedupeOnly, &["l.surname = r.surname"]);
        let sql = block_new_records_sql(&s, s.blocking_rules(), "existing", "incoming");
        assert!(sql.contains("from existing as l inner join incoming as r on (l.surname = r.surname)"));
        assert!(sql.ends_with(
            "where concat(l.source_dataset, '-__-', l.unique_id) != concat(r.source_dataset, '-__-', r.unique_id)"
        ));
        assert!(!sql.contains(" < "));
    }
}
