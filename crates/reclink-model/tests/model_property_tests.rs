//! Property tests for the comparison model.
//!
//! - Bayes factors move monotonically with m and against u
//! - the null level stays neutral whatever the other levels hold
//! - comparison vector values are dense, unique and descending

use proptest::prelude::*;
use reclink_model::{ComparisonSpec, LevelSpec, LinkType, Settings, SettingsSpec};

fn settings_with(m: f64, u: f64, extra_levels: usize) -> Settings {
    let mut levels = vec![
        LevelSpec::null_level("name"),
        LevelSpec::exact_match("name").with_m(m).with_u(u),
    ];
    for i in 0..extra_levels {
        levels.push(LevelSpec::new(format!("levenshtein(name_l, name_r) <= {}", i + 1)));
    }
    levels.push(LevelSpec::else_level());
    Settings::from_spec(SettingsSpec::new(
        LinkType::DedupeOnly,
        vec![ComparisonSpec::new("name", levels)],
    ))
    .expect("valid settings")
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn bayes_factor_decreases_as_u_grows(m in 0.01f64..=1.0, u1 in 0.001f64..=1.0, u2 in 0.001f64..=1.0) {
        let (lo, hi) = if u1 <= u2 { (u1, u2) } else { (u2, u1) };
        let bf = |u: f64| {
            settings_with(m, u, 0).comparison("name").unwrap().levels()[1].bayes_factor()
        };
        prop_assert!(bf(lo) >= bf(hi));
    }

    #[test]
    fn bayes_factor_grows_with_m(m1 in 0.0f64..=1.0, m2 in 0.0f64..=1.0, u in 0.001f64..=1.0) {
        let (lo, hi) = if m1 <= m2 { (m1, m2) } else { (m2, m1) };
        let bf = |m: f64| {
            settings_with(m, u, 0).comparison("name").unwrap().levels()[1].bayes_factor()
        };
        prop_assert!(bf(lo) <= bf(hi));
    }

    #[test]
    fn null_level_is_always_neutral(m in 0.0f64..=1.0, u in 0.0f64..=1.0, extra in 0usize..4) {
        let settings = settings_with(m, u, extra);
        let null = &settings.comparison("name").unwrap().levels()[0];
        prop_assert_eq!(null.bayes_factor(), 1.0);
        prop_assert_eq!(null.log2_bayes_factor(), 0.0);
    }

    #[test]
    fn vector_values_are_dense_and_descending(extra in 0usize..6) {
        let settings = settings_with(0.9, 0.1, extra);
        let comparison = settings.comparison("name").unwrap();
        let values: Vec<i32> = comparison.non_null_levels().map(|l| l.comparison_vector_value()).collect();
        let expected: Vec<i32> = (0..comparison.num_levels() as i32).rev().collect();
        prop_assert_eq!(values, expected);
    }
}

#[test]
fn settings_load_from_json_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.json");
    let original = settings_with(0.9, 0.05, 1);
    std::fs::write(&path, original.to_json_pretty().expect("serialises")).expect("write");

    let loaded = Settings::from_json_file(&path).expect("loads");
    let level = &loaded.comparison("name").expect("comparison").levels()[1];
    assert_eq!(level.m_probability(), Some(0.9));
    assert_eq!(level.u_probability(), Some(0.05));
    assert_eq!(loaded.comparisons()[0].num_levels(), 3);
}

#[test]
fn missing_settings_file_is_a_configuration_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = Settings::from_json_file(dir.path().join("absent.json")).unwrap_err();
    assert!(err.to_string().contains("absent.json"));
}
