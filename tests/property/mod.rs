//! Property-based tests for naming, exclusion and retention invariants

use checkpoint::*;
use proptest::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Strategy for arbitrary raw suffix input, printable ASCII plus noise.
fn raw_suffix_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(proptest::char::range(' ', '~'), 0..40)
        .prop_map(|chars| chars.into_iter().collect())
}

/// Strategy for structurally valid snapshot timestamps.
fn timestamp_strategy() -> impl Strategy<Value = String> {
    (2000u32..2100, 1u32..13, 1u32..29, 0u32..24, 0u32..60, 0u32..60).prop_map(
        |(y, mo, d, h, mi, s)| format!("{:04}{:02}{:02}_{:02}{:02}{:02}", y, mo, d, h, mi, s),
    )
}

proptest! {
    #[test]
    fn sanitised_suffixes_stay_in_charset(raw in raw_suffix_strategy()) {
        let clean = sanitize_suffix(&raw);
        prop_assert!(clean
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        // Sanitisation is idempotent
        prop_assert_eq!(sanitize_suffix(&clean), clean);
    }

    #[test]
    fn valid_names_round_trip(ts in timestamp_strategy(), raw in raw_suffix_strategy()) {
        let clean = sanitize_suffix(&raw);
        let name = if clean.is_empty() {
            SnapshotName::parse(&ts).unwrap()
        } else {
            match SnapshotName::from_parts(&ts, Some(&raw)) {
                Ok(name) => name,
                Err(_) => return Ok(()), // unusable suffix, nothing to check
            }
        };
        // Rendering and re-parsing is the identity
        let reparsed = SnapshotName::parse(name.as_str()).unwrap();
        prop_assert_eq!(&reparsed, &name);
        // The timestamp survives embedding in the name
        prop_assert_eq!(
            name.timestamp().unwrap().format("%Y%m%d_%H%M%S").to_string(),
            ts
        );
    }

    #[test]
    fn default_exclusions_hold_under_user_patterns(extra in raw_suffix_strategy()) {
        // Whatever the user adds, the engine's own artefacts stay excluded
        let user = vec![sanitize_suffix(&extra)]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();
        let matcher = ExclusionMatcher::new(
            Path::new("/src"),
            Path::new("/elsewhere"),
            &user,
        )
        .unwrap();
        prop_assert!(matcher.is_excluded(Path::new(".checkpoint.lock"), true));
        prop_assert!(matcher.is_excluded(Path::new(".tmp.token123"), true));
        prop_assert!(matcher.is_excluded(Path::new("tmp"), true));
    }

    #[test]
    fn retention_keeps_the_greatest_k_names(
        days in proptest::collection::btree_set(1u32..28, 2..12),
        k in 1usize..12,
    ) {
        let root = TempDir::new().unwrap();
        let names: Vec<String> = days
            .iter()
            .map(|d| format!("202501{:02}_120000", d))
            .collect();
        for name in &names {
            fs::create_dir(root.path().join(name)).unwrap();
        }

        prune(root.path(), RetentionRule::KeepCount(k), false, 0).unwrap();

        let remaining = list_snapshots(root.path()).unwrap();
        let keep = k.min(names.len());
        prop_assert_eq!(remaining.len(), keep);
        // The survivors are exactly the k greatest names
        let mut expected = names.clone();
        expected.sort();
        let expected: Vec<&String> = expected.iter().rev().take(keep).rev().collect();
        let actual: Vec<&str> = remaining.iter().map(|n| n.as_str()).collect();
        prop_assert_eq!(
            actual,
            expected.iter().map(|s| s.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn metadata_records_round_trip(
        pairs in proptest::collection::vec(
            ("[A-Za-z0-9_]{1,12}", "[ -<>-~]{0,24}"),
            0..8,
        ),
    ) {
        let mut record = MetadataRecord::new();
        for (key, value) in &pairs {
            record.set(key, value).unwrap();
        }
        let reparsed = MetadataRecord::parse(&record.render());
        prop_assert_eq!(reparsed, record);
    }
}
