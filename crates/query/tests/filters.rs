#![forbid(unsafe_code)]

use quarry_core::{Details, RelationFormat};
use quarry_query::{make_filters, make_order, BuildCtx, Condition, FilterRequest, ObjectStore, Query, SortRequest};
use quarry_store::MemStore;

fn obj(id: &str) -> Details { Details::new().with("id", id) }

fn ids(store: &MemStore, reqs: &[FilterRequest], sorts: &[SortRequest]) -> Vec<String> {
    let ctx = BuildCtx::new(store, 0);
    let filter = make_filters(&ctx, reqs).expect("filters");
    let order = make_order(store, sorts).expect("order");
    let q = match &order {
        Some(o) => Query::ordered(&filter, o),
        None => Query::new(&filter),
    };
    store.query(&q).expect("query").iter().map(|d| d.id().to_string()).collect()
}

#[test]
fn default_filters_hide_archived_deleted_and_spaces() {
    let s = MemStore::new();
    s.put(obj("a").with("name", "a"));
    s.put(obj("b").with("isArchived", true));
    s.put(obj("c").with("isDeleted", true));
    s.put(obj("d").with("layout", "space"));
    assert_eq!(ids(&s, &[], &[]), vec!["a"]);

    let archived = FilterRequest::new("isArchived", Condition::Equal, true);
    assert_eq!(ids(&s, &[archived], &[]), vec!["b"]);
}

#[test]
fn false_checkbox_matches_unset() {
    let s = MemStore::new();
    s.put(obj("a").with("done", true));
    s.put(obj("b"));
    s.put(obj("c").with("done", false));
    let not_done = FilterRequest::new("done", Condition::Equal, false);
    assert_eq!(ids(&s, &[not_done], &[]), vec!["b", "c"]);
}

#[test]
fn nested_key_resolves_referenced_objects() {
    let s = MemStore::new();
    s.put(obj("p1").with("name", "Alice"));
    s.put(obj("p2").with("name", "Bob"));
    s.put(obj("t1").with("assignee", vec!["p1"]));
    s.put(obj("t2").with("assignee", vec!["p2"]));
    s.put(obj("t3"));

    let by_alice = FilterRequest::new("assignee.name", Condition::Equal, "Alice");
    assert_eq!(ids(&s, &[by_alice], &[]), vec!["t1"]);

    let not_alice = FilterRequest::new("assignee.name", Condition::NotEqual, "Alice");
    let got = ids(&s, &[not_alice], &[]);
    assert!(got.contains(&"t2".to_string()));
    assert!(got.contains(&"t3".to_string()));
    assert!(!got.contains(&"t1".to_string()));
}

#[test]
fn exact_in_ignores_deleted_options() {
    let s = MemStore::new();
    s.set_relation_format("tag", RelationFormat::Tag);
    let opt = |id: &str| obj(id).with("layout", "relationOption").with("relationKey", "tag");
    s.put(opt("o1"));
    s.put(opt("o2"));
    s.put(opt("gone").with("isDeleted", true));
    s.put(obj("x").with("tag", vec!["o1", "o2", "gone"]));
    s.put(obj("y").with("tag", vec!["o1"]));

    let exact = FilterRequest::new("tag", Condition::ExactIn, vec!["o1", "o2"]);
    assert_eq!(ids(&s, &[exact], &[]), vec!["x"]);
}

#[test]
fn or_of_like_and_value_comparison() {
    let s = MemStore::new();
    s.put(obj("a").with("name", "Quarterly report").with("spent", 10).with("budget", 20));
    s.put(obj("b").with("name", "Notes").with("spent", 30).with("budget", 20));
    s.put(obj("c").with("name", "misc").with("spent", 5).with("budget", 20));

    let like = FilterRequest::new("name", Condition::Like, "REPORT");
    let over: FilterRequest = serde_json::from_value(serde_json::json!({
        "relationKey": "spent",
        "condition": "Greater",
        "value": { "type": "valueFromRelation", "relationKey": "budget" }
    }))
    .expect("request");
    assert_eq!(ids(&s, &[FilterRequest::or(vec![like, over])], &[]), vec!["a", "b"]);
}

#[test]
fn tag_sort_uses_option_order_ids() {
    let s = MemStore::new();
    s.set_relation_format("tag", RelationFormat::Tag);
    let opt = |id: &str, order: &str, name: &str| {
        obj(id).with("layout", "relationOption").with("relationKey", "tag").with("orderId", order).with("name", name)
    };
    s.put(opt("earth", "BB", "Earth"));
    s.put(opt("mars", "AA", "Mars"));
    s.put(obj("x").with("tag", vec!["earth"]));
    s.put(obj("y").with("tag", vec!["mars"]));
    s.put(obj("z"));

    let tag = FilterRequest::new("tag", Condition::NotEmpty, quarry_core::Value::Null);
    assert_eq!(ids(&s, &[tag], &[SortRequest::asc("tag")]), vec!["y", "x"]);
}
