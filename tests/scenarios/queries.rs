//! Scenario 5: multi-tag queries over a populated store

use crate::common::test_engine;
use entitydb::{Engine, Error, Query, SortOrder};

/// 300 entities: every third is a task, every fifth is open.
fn seed(engine: &Engine) {
    for i in 0..300 {
        let kind = if i % 3 == 0 { "type:task" } else { "type:doc" };
        let status = if i % 5 == 0 {
            "status:open"
        } else {
            "status:closed"
        };
        engine
            .create(
                &format!("w{:04}", i),
                &[kind, status],
                Vec::new(),
            )
            .unwrap();
    }
}

#[test]
fn scenario_multi_tag_query_exact() {
    let (engine, _dir) = test_engine();
    seed(&engine);

    let ids = engine
        .query(&Query::with_tags(["type:task", "status:open"]))
        .unwrap();

    let expected: Vec<String> = (0..300)
        .filter(|i| i % 3 == 0 && i % 5 == 0)
        .map(|i| format!("w{:04}", i))
        .collect();
    let got: Vec<String> = ids.iter().map(|id| id.as_str().to_owned()).collect();
    assert_eq!(got, expected);
}

#[test]
fn query_empty_intersection() {
    let (engine, _dir) = test_engine();
    seed(&engine);

    let ids = engine
        .query(&Query::with_tags(["type:task", "status:nosuch"]))
        .unwrap();
    assert!(ids.is_empty());
}

#[test]
fn query_pagination() {
    let (engine, _dir) = test_engine();
    seed(&engine);

    let all = engine.query(&Query::with_tags(["type:task"])).unwrap();
    let page = engine
        .query(&Query::with_tags(["type:task"]).offset(10).limit(5))
        .unwrap();
    assert_eq!(page.len(), 5);
    assert_eq!(page[..], all[10..15]);
}

#[test]
fn query_sort_orders() {
    let (engine, _dir) = test_engine();
    seed(&engine);

    let asc = engine.query(&Query::with_tags(["type:task"])).unwrap();
    assert!(asc.windows(2).all(|w| w[0] < w[1]));

    let desc = engine
        .query(&Query::with_tags(["type:task"]).sort(SortOrder::IdDescending))
        .unwrap();
    let mut reversed = asc.clone();
    reversed.reverse();
    assert_eq!(desc, reversed);
}

#[test]
fn query_updated_descending_puts_fresh_first() {
    let (engine, _dir) = test_engine();
    seed(&engine);

    // The fresh priority tag stamps the new version with the current
    // wall time.
    engine
        .update("w0000", &["type:task", "status:open", "priority:high"], Vec::new())
        .unwrap();

    let ids = engine
        .query(
            &Query::with_tags(["type:task", "status:open"])
                .sort(SortOrder::UpdatedDescending)
                .limit(1),
        )
        .unwrap();
    assert_eq!(ids[0].as_str(), "w0000");
}

#[test]
fn invalid_filters_rejected() {
    let (engine, _dir) = test_engine();

    assert!(matches!(
        engine.query(&Query::default()),
        Err(Error::InvalidFilter { .. })
    ));
    assert!(matches!(
        engine.query(&Query::with_tags(["not-a-tag"])),
        Err(Error::InvalidFilter { .. })
    ));
}

#[test]
fn query_excludes_tombstoned() {
    let (engine, _dir) = test_engine();
    seed(&engine);

    engine.delete("w0000").unwrap();
    let ids = engine
        .query(&Query::with_tags(["type:task", "status:open"]))
        .unwrap();
    assert!(ids.iter().all(|id| id.as_str() != "w0000"));
}
