//! Property tests for recording invariants.
//!
//! Uses proptest to verify:
//! 1. Deterministic identity: the same (entity, timestamp, level) always yields the same id
//! 2. Window sizing: size == min(recordable periods, page size), none is ClosedForNow
//! 3. Explicit timestamps: the window is exactly the unpersisted candidates, ascending
//! 4. At most one row per id, whatever order batches arrive in

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use tidemark_core::domain::ids::periodic_id;
use tidemark_core::domain::{Entity, FieldValue, IdRule, Level, Payload, Record};
use tidemark_core::{
    ColumnType, NamespaceKey, RecordQuery, Schema, StorageRoot, Store, WindowEvaluator,
    WindowState,
};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_level() -> impl Strategy<Value = Level> {
    prop_oneof![
        Just(Level::Minute1),
        Just(Level::Minute15),
        Just(Level::Hour1),
        Just(Level::Day1),
        Just(Level::Week1),
    ]
}

fn arb_code() -> impl Strategy<Value = String> {
    "[0-9]{6}"
}

/// Seconds after `base()`, within ~3 years.
fn arb_offset() -> impl Strategy<Value = i64> {
    0..100_000_000_i64
}

// ── 1. Deterministic identity ────────────────────────────────────────

proptest! {
    #[test]
    fn ids_are_deterministic(code in arb_code(), offset in arb_offset(), level in arb_level()) {
        let entity = Entity::new("stock", "sz", &code);
        let ts = base() + Duration::seconds(offset);
        let payload = Payload::new();
        let rule = IdRule::default();

        let a = rule.generate(&entity.id, ts, level, &payload);
        let b = rule.generate(&entity.id, ts, level, &payload);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a, periodic_id(&entity.id, ts, level, false));
    }

    /// Distinct days of one entity never share a daily id.
    #[test]
    fn daily_ids_differ_across_days(code in arb_code(), d1 in 0..3000_i64, d2 in 0..3000_i64) {
        prop_assume!(d1 != d2);
        let entity = Entity::new("stock", "sz", &code);
        let a = periodic_id(&entity.id, base() + Duration::days(d1), Level::Day1, false);
        let b = periodic_id(&entity.id, base() + Duration::days(d2), Level::Day1, false);
        prop_assert_ne!(a, b);
    }
}

// ── 2. Window sizing ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn size_is_elapsed_capped_at_page(
        elapsed in 0..5000_i64,
        page in 1..3000_usize,
        into_period in 0..86_400_i64,
        keep_unfinished in any::<bool>(),
    ) {
        let eval = WindowEvaluator::new(Level::Day1, page).with_unfinished(keep_unfinished);
        let entity = Entity::new("stock", "sz", "000001");
        let cursor = base();
        let now = cursor + Duration::days(elapsed) + Duration::seconds(into_period);

        // the day holding `now` is still trading unless unfinished days are kept
        let due = if keep_unfinished { elapsed } else { (elapsed - 1).max(0) };
        let w = eval.evaluate(&entity, Some(cursor), now);
        if due == 0 {
            prop_assert_eq!(w.state, WindowState::ClosedForNow);
            prop_assert_eq!(w.size, 0);
            prop_assert!(w.wait.is_some());
        } else {
            prop_assert_eq!(w.state, WindowState::OpenPeriod);
            prop_assert_eq!(w.size, (due as usize).min(page));
            prop_assert_eq!(w.start, Some(cursor + Duration::days(1)));
        }
    }

    /// The evaluator reads only its inputs: same cursor and clock, same window.
    #[test]
    fn evaluation_is_pure(offset in arb_offset(), elapsed in 0..500_i64, level in arb_level()) {
        let eval = WindowEvaluator::new(level, 100);
        let entity = Entity::new("stock", "sz", "000001");
        let cursor = level.period_start(base() + Duration::seconds(offset));
        let now = cursor + Duration::hours(elapsed);
        prop_assert_eq!(
            eval.evaluate(&entity, Some(cursor), now),
            eval.evaluate(&entity, Some(cursor), now)
        );
    }
}

// ── 3. Explicit timestamps ───────────────────────────────────────────

proptest! {
    #[test]
    fn timestamp_window_is_the_unpersisted_rest(
        days in prop::collection::btree_set(0..365_i64, 1..40),
        persisted_mask in prop::collection::vec(any::<bool>(), 40),
    ) {
        let candidates: Vec<DateTime<Utc>> =
            days.iter().rev().map(|d| base() + Duration::days(*d)).collect();
        let persisted: BTreeSet<DateTime<Utc>> = candidates
            .iter()
            .zip(&persisted_mask)
            .filter(|(_, keep)| **keep)
            .map(|(ts, _)| *ts)
            .collect();

        let eval = WindowEvaluator::new(Level::Day1, 2000);
        let w = eval.evaluate_timestamps(&candidates, &persisted, base() + Duration::days(400));

        let mut expected: Vec<DateTime<Utc>> =
            candidates.iter().copied().filter(|ts| !persisted.contains(ts)).collect();
        expected.sort();
        if expected.is_empty() {
            prop_assert_eq!(w.state, WindowState::Terminal);
        } else {
            prop_assert_eq!(w.size, expected.len());
        }
        prop_assert_eq!(w.timestamps, expected);
    }
}

// ── 4. At most one row per id ────────────────────────────────────────

fn record(schema: &Schema, entity: &Entity, day: i64, close: f64) -> Record {
    let ts = base() + Duration::days(day);
    let mut payload = Payload::new();
    payload.insert("close".into(), FieldValue::Float(close));
    Record {
        id: schema.id_rule.generate(&entity.id, ts, schema.level, &payload),
        entity: entity.entity_ref(),
        timestamp: ts,
        provider: "prop".into(),
        level: schema.level,
        payload,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn overlapping_batches_store_each_day_once(
        batches in prop::collection::vec(prop::collection::btree_set(0..60_i64, 1..20), 1..6),
        force in any::<bool>(),
    ) {
        let schema = Schema::new("stock_1d_prop", "stock", Level::Day1)
            .with_column("close", ColumnType::Float);
        let store = Store::open(&StorageRoot::Memory, NamespaceKey::new("prop", "flow")).unwrap();
        store.ensure_table(&schema).unwrap();
        let entity = Entity::new("stock", "sz", "000001");

        let mut distinct = BTreeSet::new();
        for (n, days) in batches.iter().enumerate() {
            let records: Vec<Record> =
                days.iter().map(|d| record(&schema, &entity, *d, n as f64)).collect();
            let outcome = store.commit(&schema, &records, force).unwrap();
            prop_assert_eq!(outcome.inserted + outcome.updated + outcome.skipped, records.len());
            distinct.extend(days.iter().copied());
        }

        prop_assert_eq!(store.count(&schema.table).unwrap(), distinct.len() as u64);
        let loaded = store.load(&schema, &RecordQuery::default()).unwrap();
        let ids: BTreeSet<_> = loaded.iter().map(|r| r.id.clone()).collect();
        prop_assert_eq!(ids.len(), loaded.len());
    }
}
