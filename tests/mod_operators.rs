mod common;

use bson::{Bson, bson, doc};
use docmapper::errors::MapperError;
use docmapper::query::operators::apply;
use docmapper::query::{PathContext, resolve};

fn leaf(key: &str, value: Bson) -> Result<bson::Document, MapperError> {
    let reg = common::registry();
    let s = reg.get("BlogPost").unwrap();
    let path = resolve(&reg, &s, key, PathContext::Query)?;
    apply(&path, value)
}

#[test]
fn comparison_operators_emit_wire_symbols() {
    assert_eq!(leaf("page_views__lte", 18.into()).unwrap(), doc! { "page_views": { "$lte": 18 } });
    assert_eq!(leaf("page_views", 18.into()).unwrap(), doc! { "page_views": 18 });
    assert_eq!(leaf("tags__size", 2.into()).unwrap(), doc! { "tags": { "$size": 2 } });
    assert_eq!(leaf("title__exists", true.into()).unwrap(), doc! { "title": { "$exists": true } });
    assert_eq!(leaf("page_views__mod", bson!([5, 1])).unwrap(), doc! { "page_views": { "$mod": [5, 1] } });
    assert_eq!(
        leaf("tags__all", bson!(["a", "b"])).unwrap(),
        doc! { "tags": { "$all": ["a", "b"] } }
    );
}

#[test]
fn value_shapes_are_checked() {
    for (key, value) in [
        ("tags__in", Bson::from("a")),
        ("tags__nin", Bson::from(1)),
        ("tags__all", Bson::from(true)),
        ("page_views__mod", bson!([5])),
        ("page_views__mod", bson!([0, 1])),
        ("tags__size", Bson::from(-1)),
        ("tags__size", Bson::from("2")),
        ("title__exists", Bson::from(1)),
        ("title__contains", Bson::from(3)),
        ("comments__match", Bson::from("x")),
    ] {
        let err = leaf(key, value).unwrap_err();
        assert!(matches!(err, MapperError::InvalidValueShape { .. }), "{key}: {err}");
    }
}

#[test]
fn not_wraps_the_next_operator() {
    assert_eq!(
        leaf("page_views__not__gt", 5.into()).unwrap(),
        doc! { "page_views": { "$not": { "$gt": 5 } } }
    );
}

#[test]
fn string_shortcuts_escape_and_flag_case() {
    assert_eq!(leaf("title__contains", "a.b".into()).unwrap(), doc! { "title": { "$regex": "a\\.b" } });
    assert_eq!(
        leaf("title__istartswith", "Rust".into()).unwrap(),
        doc! { "title": { "$regex": "^Rust", "$options": "i" } }
    );
    assert_eq!(leaf("title__endswith", "x".into()).unwrap(), doc! { "title": { "$regex": "x$" } });
    assert_eq!(
        leaf("title__iexact", "Hi".into()).unwrap(),
        doc! { "title": { "$regex": "^Hi$", "$options": "i" } }
    );
}

#[test]
fn match_builds_elem_match() {
    assert_eq!(
        leaf("comments__match", bson!({ "by": "ann", "votes": { "$gte": 2 } })).unwrap(),
        doc! { "comments": { "$elemMatch": { "by": "ann", "votes": { "$gte": 2 } } } }
    );
}

#[test]
fn legacy_geo_on_geo_point_fields() {
    assert_eq!(
        leaf("location__within_distance", bson!([[1.0, 2.0], 5.0])).unwrap(),
        doc! { "location": { "$within": { "$center": [[1.0, 2.0], 5.0] } } }
    );
    assert_eq!(leaf("location__near", bson!([1.0, 2.0])).unwrap(), doc! { "location": { "$near": [1.0, 2.0] } });
    assert!(matches!(
        leaf("location__geo_within", bson!([1.0, 2.0])),
        Err(MapperError::UnsupportedOperator(_))
    ));
}

#[test]
fn geojson_operators_normalize_geometry() {
    let raw = leaf("point__geo_within", bson!([[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]])).unwrap();
    assert_eq!(
        raw,
        doc! { "point": { "$geoWithin": { "$geometry": {
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]]
        } } } }
    );
    let mapping = leaf(
        "point__geo_within",
        bson!({ "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]] }),
    )
    .unwrap();
    assert_eq!(raw, mapping);
    assert_eq!(
        leaf("area__geo_intersects", bson!([1.0, 2.0])).unwrap(),
        doc! { "area": { "$geoIntersects": { "$geometry": { "type": "Point", "coordinates": [1.0, 2.0] } } } }
    );
}

#[test]
fn geo_operators_need_geo_fields() {
    assert!(matches!(leaf("title__near", bson!([1.0, 2.0])), Err(MapperError::UnsupportedOperator(_))));
}

#[test]
fn reference_fields_convert_hex_ids() {
    let id = bson::oid::ObjectId::new();
    assert_eq!(leaf("owner", id.to_hex().into()).unwrap(), doc! { "owner": id });
    assert_eq!(leaf("owner__in", bson!([id.to_hex()])).unwrap(), doc! { "owner": { "$in": [id] } });
    assert_eq!(leaf("owner", "not-hex".into()).unwrap(), doc! { "owner": "not-hex" });
}
