mod common;

use bson::{Document, bson, doc};
use docmapper::errors::MapperError;
use docmapper::query::{Modifier, Modifiers, UpdateSpec, compile_update};

fn compile(modifiers: &Document) -> Result<UpdateSpec, MapperError> {
    let reg = common::registry();
    let s = reg.get("BlogPost").unwrap();
    compile_update(&reg, &s, modifiers)
}

#[test]
fn modifiers_map_to_wire_groups() {
    let spec = compile(&doc! {
        "set": { "title": "new", "author__name": "ann" },
        "unset": { "rating": 1 },
        "inc": { "page_views": 1 },
        "push": { "tags": "rust" },
        "pop": { "tags": -1 },
    })
    .unwrap();
    assert_eq!(
        spec.as_document(),
        &doc! {
            "$set": { "title": "new", "author.name": "ann" },
            "$unset": { "r": 1 },
            "$inc": { "page_views": 1 },
            "$push": { "tags": "rust" },
            "$pop": { "tags": -1 },
        }
    );
}

#[test]
fn dec_folds_into_inc() {
    let spec = compile(&doc! { "inc": { "page_views": 2 }, "dec": { "rating": 1.5 } }).unwrap();
    assert_eq!(spec.group("$inc").unwrap(), &doc! { "page_views": 2, "r": -1.5 });
}

#[test]
fn dec_never_turns_into_an_increment() {
    let spec = compile(&doc! { "dec": { "page_views": -1, "rating": 0.0 } }).unwrap();
    assert_eq!(spec.group("$inc").unwrap(), &doc! { "page_views": -1, "r": 0.0 });
    let spec = compile(&Modifiers::new().dec("page_views", 3_i64).into_document()).unwrap();
    assert_eq!(spec.group("$inc").unwrap(), &doc! { "page_views": -3_i64 });
}

#[test]
fn inc_and_dec_on_one_field_conflict() {
    let err = compile(&doc! { "inc": { "page_views": 2 }, "dec": { "page_views": 1 } }).unwrap_err();
    assert!(matches!(err, MapperError::ConflictingModifier(f) if f == "page_views"));
}

#[test]
fn positional_marker_becomes_placeholder() {
    let spec = compile(&doc! { "inc": { "comments__S__votes": 1 } }).unwrap();
    assert_eq!(spec.group("$inc").unwrap(), &doc! { "comments.$.votes": 1 });
    let spec = compile(&doc! { "set": { "comments__1__text": "hi" } }).unwrap();
    assert_eq!(spec.group("$set").unwrap(), &doc! { "comments.1.text": "hi" });
}

#[test]
fn value_shapes_per_modifier() {
    for m in [
        doc! { "pop": { "tags": 2 } },
        doc! { "pop": { "tags": "first" } },
        doc! { "pull_all": { "tags": "a" } },
        doc! { "add_to_set": { "tags": "a" } },
        doc! { "inc": { "page_views": "one" } },
        doc! { "dec": { "page_views": true } },
        doc! { "set": "not a mapping" },
    ] {
        let err = compile(&m).unwrap_err();
        assert!(matches!(err, MapperError::InvalidValueShape { .. }), "{m}: {err}");
    }
}

#[test]
fn unknown_modifier_and_empty_update() {
    assert!(matches!(
        compile(&doc! { "rename": { "title": "t" } }),
        Err(MapperError::UnsupportedOperator(_))
    ));
    assert!(matches!(compile(&doc! {}), Err(MapperError::CallerContract(_))));
    assert!(matches!(
        compile(&doc! { "set": { "nope": 1 } }),
        Err(MapperError::Resolution { .. })
    ));
}

#[test]
fn add_to_set_uses_each() {
    let spec = compile(&doc! { "add_to_set": { "tags": ["a", "b"] } }).unwrap();
    assert_eq!(spec.group("$addToSet").unwrap(), &doc! { "tags": { "$each": ["a", "b"] } });
}

#[test]
fn pull_with_trailing_operator_and_nested_paths() {
    let spec = compile(&doc! { "pull": { "tags__in": ["a", "b"] } }).unwrap();
    assert_eq!(spec.group("$pull").unwrap(), &doc! { "tags": { "$in": ["a", "b"] } });

    let spec = compile(&doc! { "pull": { "comments__by": "ann" } }).unwrap();
    assert_eq!(spec.group("$pull").unwrap(), &doc! { "comments": { "by": "ann" } });

    let err = compile(&doc! { "pull_all": { "comments__by": ["ann"] } }).unwrap_err();
    assert!(matches!(err, MapperError::Resolution { .. }));
}

#[test]
fn nested_pulls_on_one_list_merge() {
    let spec = compile(&doc! { "pull": { "comments__by": "ann", "comments__votes": 0 } }).unwrap();
    assert_eq!(spec.group("$pull").unwrap(), &doc! { "comments": { "by": "ann", "votes": 0 } });
}

#[test]
fn raw_update_is_merged_verbatim() {
    let spec = compile(&doc! { "__raw__": { "$currentDate": { "seen": true } }, "set": { "title": "t" } }).unwrap();
    assert_eq!(
        spec.as_document(),
        &doc! { "$currentDate": { "seen": true }, "$set": { "title": "t" } }
    );
}

#[test]
fn raw_groups_merge_regardless_of_order() {
    let after = Modifiers::new().set("title", "t").raw(doc! { "$set": { "published": true } });
    let before = Modifiers::new().raw(doc! { "$set": { "published": true } }).set("title", "t");
    for m in [after, before] {
        let spec = compile(&m.into_document()).unwrap();
        assert_eq!(spec.group("$set").unwrap(), &doc! { "title": "t", "published": true });
    }
}

#[test]
fn raw_groups_clashing_with_a_modifier_are_rejected() {
    let after = Modifiers::new().set("title", "t").raw(doc! { "$set": { "title": "u" } });
    assert!(matches!(compile(&after.into_document()), Err(MapperError::ConflictingModifier(k)) if k == "title"));
    let before = Modifiers::new().raw(doc! { "$set": { "title": "u" } }).set("title", "t");
    assert!(matches!(compile(&before.into_document()), Err(MapperError::ConflictingModifier(k)) if k == "title"));
    let shape = doc! { "set": { "title": "t" }, "__raw__": { "$set": 1 } };
    assert!(matches!(compile(&shape), Err(MapperError::ConflictingModifier(k)) if k == "$set"));
}

#[test]
fn set_on_insert_and_object_ids() {
    let id = bson::oid::ObjectId::new();
    let spec = compile(&doc! { "set_on_insert": { "owner": id.to_hex() } }).unwrap();
    assert_eq!(spec.group("$setOnInsert").unwrap(), &doc! { "owner": id });
}

#[test]
fn builder_produces_modifier_mappings() {
    let m = Modifiers::new()
        .set("title", "t")
        .inc("page_views", 1)
        .dec("rating", 2)
        .add_to_set("tags", bson!(["x"]))
        .with(Modifier::Pop, "tags", 1);
    let spec = compile(&m.into_document()).unwrap();
    assert_eq!(spec.group("$inc").unwrap(), &doc! { "page_views": 1, "r": -2 });
    assert_eq!(spec.group("$pop").unwrap(), &doc! { "tags": 1 });
    assert_eq!(spec.group("$set").unwrap(), &doc! { "title": "t" });
}
