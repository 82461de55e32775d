mod common;

use std::sync::Arc;

use bson::{Bson, bson, doc};
use docmapper::Database;
use docmapper::errors::MapperError;
use docmapper::query::{CursorState, GetOrCreateOptions, Modifiers, Q};
use docmapper::transport::MemoryTransport;

fn seeded(n: i32) -> (Arc<MemoryTransport>, Database) {
    let transport = common::memory();
    let db = common::database(&transport);
    for i in 0..n {
        db.create(
            "BlogPost",
            [("title", Bson::from(format!("post {i}"))), ("page_views", Bson::from(i))],
        )
        .unwrap();
    }
    (transport, db)
}

fn views(docs: &[bson::Document]) -> Vec<i32> {
    docs.iter().map(|d| d.get_i32("page_views").unwrap()).collect()
}

#[test]
fn construction_is_lazy() {
    let (t, db) = seeded(3);
    let cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.state(), CursorState::Unexecuted);
    assert_eq!(t.metrics().queries, 0);
}

#[test]
fn repeated_iteration_replays_the_cache() {
    let (t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    let first = cursor.to_vec().unwrap();
    assert_eq!(first.len(), 3);
    for _ in 0..3 {
        assert_eq!(cursor.to_vec().unwrap(), first);
    }
    assert_eq!(cursor.state(), CursorState::Exhausted);
    assert_eq!(t.metrics().queries, 1);
}

#[test]
fn batches_append_in_arrival_order() {
    let (t, db) = seeded(5);
    let mut cursor = db.objects("BlogPost").unwrap().with_batch_size(Some(2));
    let head = cursor.iter().next().unwrap().unwrap();
    assert_eq!(head.get_i32("page_views").unwrap(), 0);
    assert_eq!(cursor.state(), CursorState::Streaming);
    assert_eq!(cursor.cached_len(), 2);
    assert_eq!(t.metrics().queries, 1);

    let all = cursor.to_vec().unwrap();
    assert_eq!(views(&all), [0, 1, 2, 3, 4]);
    assert_eq!(t.metrics().queries, 3);
    cursor.to_vec().unwrap();
    assert_eq!(t.metrics().queries, 3);
}

#[test]
fn unbatched_cursor_fetches_once() {
    let (t, db) = seeded(5);
    let mut cursor = db.objects("BlogPost").unwrap().with_batch_size(None);
    assert_eq!(cursor.to_vec().unwrap().len(), 5);
    assert_eq!(t.metrics().queries, 1);
}

#[test]
fn index_out_of_range_is_an_error() {
    let (t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    cursor.to_vec().unwrap();
    assert!(matches!(cursor.index(5), Err(MapperError::IndexRange { index: 5, len: 3 })));
    assert_eq!(cursor.index(1).unwrap().get_i32("page_views").unwrap(), 1);
    assert_eq!(t.metrics().queries, 1);
}

#[test]
fn index_before_execution_uses_a_window_query() {
    let (t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.index(2).unwrap().get_i32("page_views").unwrap(), 2);
    assert_eq!(t.metrics().queries, 1);
    assert_eq!(cursor.cached_len(), 0);
    assert_eq!(cursor.state(), CursorState::Unexecuted);
    assert!(matches!(cursor.index(10), Err(MapperError::IndexRange { index: 10, len: 3 })));
}

#[test]
fn first_on_empty_result_is_none() {
    let (_t, db) = seeded(0);
    let mut cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.first().unwrap(), None);
    cursor.to_vec().unwrap();
    assert_eq!(cursor.first().unwrap(), None);
    assert!(cursor.is_empty().unwrap());
}

#[test]
fn slices_come_from_cache_when_covered() {
    let (t, db) = seeded(5);
    let mut cursor = db.objects("BlogPost").unwrap();
    assert_eq!(views(&cursor.slice(1, 3).unwrap()), [1, 2]);
    assert_eq!(t.metrics().queries, 1);
    cursor.to_vec().unwrap();
    assert_eq!(views(&cursor.slice(3, 10).unwrap()), [3, 4]);
    assert!(cursor.slice(4, 2).unwrap().is_empty());
    assert_eq!(t.metrics().queries, 2);
}

#[test]
fn get_requires_exactly_one_match() {
    let (_t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    let d = cursor.get(Q::new("page_views", 1)).unwrap();
    assert_eq!(d.get_str("title").unwrap(), "post 1");
    match cursor.get(Q::new("page_views", 9)) {
        Err(MapperError::DoesNotExist { doc_type }) => assert_eq!(doc_type, "BlogPost"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        cursor.get(Q::new("page_views__gte", 1)),
        Err(MapperError::MultipleObjectsReturned { .. })
    ));
}

#[test]
fn get_or_create_creates_once() {
    let (t, db) = seeded(0);
    let mut people = db.objects("Person").unwrap();
    let (created, was_created) =
        people.get_or_create(Q::new("name", "A"), &doc! { "age": 30 }, GetOrCreateOptions::default()).unwrap();
    assert!(was_created);
    let (found, was_created) =
        people.get_or_create(Q::new("name", "A"), &doc! { "age": 30 }, GetOrCreateOptions::default()).unwrap();
    assert!(!was_created);
    assert_eq!(found.get_str("name").unwrap(), "A");
    assert_eq!(found.get_i32("age").unwrap(), 30);
    assert_eq!(found.get("_id"), created.get("_id"));
    assert_eq!(t.documents("person").len(), 1);
}

#[test]
fn get_or_create_stores_aliases_and_skips_operator_conditions() {
    let (t, db) = seeded(0);
    let mut people = db.objects("Person").unwrap();
    let q = Q::from_pairs([("email", Bson::from("a@x")), ("age__gte", Bson::from(18))]);
    let (doc, created) = people.get_or_create(q, &doc! { "name": "A" }, GetOrCreateOptions::default()).unwrap();
    assert!(created);
    assert_eq!(doc.get_str("mail").unwrap(), "a@x");
    assert!(!doc.contains_key("age"));
    assert_eq!(t.documents("person")[0].get_str("name").unwrap(), "A");
}

#[test]
fn get_or_create_keeps_list_fields_as_lists() {
    let (t, db) = seeded(0);
    let mut posts = db.objects("BlogPost").unwrap();
    for (key, value) in [("comments__by", Bson::from("ann")), ("tags", Bson::from("rust"))] {
        let err = posts.get_or_create(Q::new(key, value), &doc! {}, GetOrCreateOptions::default()).unwrap_err();
        assert!(matches!(err, MapperError::Resolution { .. }), "{key}: {err:?}");
    }
    assert_eq!(t.metrics().inserts, 0);

    let (created, _) = posts
        .get_or_create(Q::new("title", "t"), &doc! { "tags": ["rust"] }, GetOrCreateOptions::default())
        .unwrap();
    assert_eq!(created.get_array("tags").unwrap(), &vec![Bson::from("rust")]);
    let cursor = db.query("BlogPost", Q::new("title", "t")).unwrap();
    cursor.update(&Modifiers::new().push("tags", "db").into_document()).unwrap();
    assert_eq!(t.documents("blog_post")[0].get_array("tags").unwrap().len(), 2);
}

#[test]
fn create_rejects_scalars_and_sub_documents_for_list_fields() {
    let (t, db) = seeded(0);
    assert!(matches!(db.create("BlogPost", [("tags", Bson::from("rust"))]), Err(MapperError::Resolution { .. })));
    assert!(matches!(
        db.create("BlogPost", [("comments__by", Bson::from("ann"))]),
        Err(MapperError::Resolution { .. })
    ));
    db.create("BlogPost", [("comments", bson!([{ "by": "ann" }]))]).unwrap();
    assert_eq!(t.documents("blog_post").len(), 1);
}

#[test]
fn create_race_is_surfaced_unless_retry_is_requested() {
    let (t, db) = seeded(0);
    t.add_unique("person", "name");
    db.create("Person", [("name", Bson::from("A")), ("age", Bson::from(30))]).unwrap();

    // The lookup misses (age differs) but the insert collides on the unique name.
    let mut cursor = db.query("Person", Q::new("age", 99)).unwrap();
    let err = cursor
        .get_or_create(Q::new("name", "A"), &doc! {}, GetOrCreateOptions::default())
        .unwrap_err();
    assert!(matches!(err, MapperError::DuplicateKey(_)));

    let before = t.metrics().queries;
    let retried = cursor.get_or_create(Q::new("name", "A"), &doc! {}, GetOrCreateOptions { retry_on_conflict: true });
    assert!(matches!(retried, Err(MapperError::DoesNotExist { .. })));
    assert_eq!(t.metrics().queries, before + 2);
}

#[test]
fn inc_update_is_visible_on_refetch() {
    let (_t, db) = seeded(0);
    db.create("BlogPost", [("title", Bson::from("x")), ("page_views", Bson::from(0))]).unwrap();
    let cursor = db.query("BlogPost", Q::new("title", "x")).unwrap();
    assert_eq!(cursor.update(&doc! { "inc": { "page_views": 1 } }).unwrap(), 1);
    let mut fresh = db.objects("BlogPost").unwrap();
    let d = fresh.get(Q::new("title", "x")).unwrap();
    assert_eq!(d.get_i32("page_views").unwrap(), 1);
}

#[test]
fn update_one_touches_a_single_document() {
    let (t, db) = seeded(3);
    let cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.update_one(&doc! { "set": { "published": true } }).unwrap(), 1);
    assert_eq!(cursor.update(&doc! { "set": { "published": true } }).unwrap(), 2);
    let published = t.documents("blog_post").iter().filter(|d| d.get_bool("published").unwrap_or(false)).count();
    assert_eq!(published, 3);
}

#[test]
fn positional_update_hits_the_matched_element() {
    let (t, db) = seeded(0);
    db.create(
        "BlogPost",
        [
            ("title", Bson::from("p")),
            ("comments", bson!([{ "by": "ann", "votes": 0 }, { "by": "bob", "votes": 0 }])),
        ],
    )
    .unwrap();
    let cursor = db.query("BlogPost", Q::new("comments__by", "bob")).unwrap();
    cursor.update(&doc! { "inc": { "comments__S__votes": 1 } }).unwrap();
    let stored = &t.documents("blog_post")[0];
    let comments = stored.get_array("comments").unwrap();
    assert_eq!(comments[0].as_document().unwrap().get_i32("votes").unwrap(), 0);
    assert_eq!(comments[1].as_document().unwrap().get_i32("votes").unwrap(), 1);
}

#[test]
fn count_prefers_cache_once_exhausted() {
    let (t, db) = seeded(4);
    let mut cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.count().unwrap(), 4);
    assert_eq!(t.metrics().counts, 1);
    cursor.to_vec().unwrap();
    assert_eq!(cursor.count().unwrap(), 4);
    assert_eq!(cursor.len().unwrap(), 4);
    assert_eq!(t.metrics().counts, 1);

    let mut window = db.objects("BlogPost").unwrap();
    window.skip(1).unwrap().limit(2).unwrap();
    assert_eq!(window.count().unwrap(), 2);
}

#[test]
fn sum_and_average_skip_absent_fields() {
    let transport = common::memory();
    let db = common::database(&transport);
    db.create("BlogPost", [("page_views", Bson::from(2))]).unwrap();
    db.create("BlogPost", [("title", Bson::from("no views"))]).unwrap();
    db.create("BlogPost", [("page_views", Bson::from(4))]).unwrap();

    let mut cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.sum("page_views").unwrap(), 6.0);
    assert_eq!(cursor.average("page_views").unwrap(), 3.0);
    assert_eq!(transport.metrics().aggregates, 2);

    cursor.to_vec().unwrap();
    assert_eq!(cursor.sum("page_views").unwrap(), 6.0);
    assert_eq!(cursor.average("page_views").unwrap(), 3.0);
    assert_eq!(transport.metrics().aggregates, 2);

    let mut none = db.query("BlogPost", Q::new("title", "missing")).unwrap();
    assert_eq!(none.average("page_views").unwrap(), 0.0);
}

#[test]
fn refining_a_fetched_cursor_needs_invalidation() {
    let (t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    cursor.to_vec().unwrap();
    assert!(matches!(cursor.filter(Q::new("page_views__gt", 0)), Err(MapperError::CallerContract(_))));
    assert!(matches!(cursor.order_by(&["-page_views"]), Err(MapperError::CallerContract(_))));
    assert!(matches!(cursor.only(&["title"]), Err(MapperError::CallerContract(_))));

    cursor.invalidate();
    assert_eq!(cursor.state(), CursorState::Invalidated);
    assert_eq!(cursor.cached_len(), 0);
    cursor.filter(Q::new("page_views__gt", 0)).unwrap();
    assert_eq!(cursor.state(), CursorState::Unexecuted);
    assert_eq!(cursor.to_vec().unwrap().len(), 2);
    assert_eq!(t.metrics().queries, 2);
}

#[test]
fn fork_starts_unexecuted() {
    let (t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    cursor.to_vec().unwrap();
    let mut copy = cursor.fork();
    assert_eq!(copy.state(), CursorState::Unexecuted);
    assert_eq!(copy.cached_len(), 0);
    copy.order_by(&["-page_views"]).unwrap();
    assert_eq!(views(&copy.to_vec().unwrap()), [2, 1, 0]);
    assert_eq!(t.metrics().queries, 2);
}

#[test]
fn only_and_exclude_replace_each_other() {
    let (_t, db) = seeded(1);
    let mut cursor = db.objects("BlogPost").unwrap();
    cursor.only(&["title"]).unwrap();
    let d = cursor.first().unwrap().unwrap();
    assert!(d.contains_key("title"));
    assert!(!d.contains_key("page_views"));

    cursor.exclude(&["title"]).unwrap();
    let d = cursor.first().unwrap().unwrap();
    assert!(!d.contains_key("title"));
    assert!(d.contains_key("page_views"));
}

#[test]
fn projection_limits_client_side_aggregation() {
    let (t, db) = seeded(3);
    let mut cursor = db.objects("BlogPost").unwrap();
    cursor.only(&["title"]).unwrap();
    cursor.to_vec().unwrap();
    assert_eq!(cursor.sum("page_views").unwrap(), 3.0);
    assert_eq!(t.metrics().aggregates, 1);
}

#[test]
fn ordering_skip_and_limit() {
    let (_t, db) = seeded(5);
    let mut cursor = db.objects("BlogPost").unwrap();
    cursor.order_by(&["-page_views"]).unwrap().skip(1).unwrap().limit(2).unwrap();
    assert_eq!(views(&cursor.to_vec().unwrap()), [3, 2]);
    assert!(matches!(cursor.index(2), Err(MapperError::IndexRange { .. })));
}

#[test]
fn limit_shorter_than_batch_stops_fetching() {
    let (t, db) = seeded(5);
    let mut cursor = db.objects("BlogPost").unwrap().with_batch_size(Some(2));
    cursor.limit(3).unwrap();
    assert_eq!(cursor.to_vec().unwrap().len(), 3);
    assert_eq!(cursor.state(), CursorState::Exhausted);
    assert_eq!(t.metrics().queries, 2);
}

#[test]
fn distinct_flattens_lists() {
    let (_t, db) = seeded(0);
    db.create("BlogPost", [("tags", bson!(["a", "b"]))]).unwrap();
    db.create("BlogPost", [("tags", bson!(["b", "c"]))]).unwrap();
    let mut cursor = db.objects("BlogPost").unwrap();
    assert_eq!(cursor.distinct("tags").unwrap(), vec![Bson::from("a"), Bson::from("b"), Bson::from("c")]);
}

#[test]
fn embedded_types_have_no_cursor() {
    let (_t, db) = seeded(0);
    assert!(matches!(db.objects("Comment"), Err(MapperError::CallerContract(_))));
    assert!(matches!(db.objects("Nope"), Err(MapperError::Resolution { .. })));
}

#[test]
fn transport_failures_surface_during_iteration() {
    let (_t, db) = seeded(1);
    let mut cursor = db.query("BlogPost", Q::new("location__near", bson!([1.0, 2.0]))).unwrap();
    let mut it = cursor.iter();
    assert!(matches!(it.next(), Some(Err(MapperError::Transport(_)))));
    assert!(it.next().is_none());
}

#[test]
fn compiled_query_is_exposed() {
    let (_t, db) = seeded(0);
    let cursor = db.query("BlogPost", Q::new("page_views__gt", 3)).unwrap();
    assert_eq!(cursor.compiled_query(), &doc! { "page_views": { "$gt": 3 } });
    assert_eq!(cursor.doc_type(), "BlogPost");
}
