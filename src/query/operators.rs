//! Operator table: maps filter-key operator tokens onto wire-level predicate documents.

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};

use super::path::FieldPath;
use super::types::MAX_IN_SET;
use crate::errors::MapperError;
use crate::schema::{FieldDescriptor, FieldKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Mod,
    All,
    Size,
    Exists,
    // string shortcuts
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Exact,
    IExact,
    // custom
    Match,
    // geo
    WithinDistance,
    WithinSphericalDistance,
    WithinBox,
    WithinPolygon,
    Near,
    NearSphere,
    MaxDistance,
    GeoWithin,
    GeoWithinBox,
    GeoWithinPolygon,
    GeoWithinCenter,
    GeoWithinSphere,
    GeoIntersects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorFamily {
    Comparison,
    String,
    Custom,
    Geo,
}

/// Modifier token that negates the following operator.
pub const NOT_TOKEN: &str = "not";

const TABLE: &[(&str, Operator)] = &[
    ("ne", Operator::Ne),
    ("gt", Operator::Gt),
    ("gte", Operator::Gte),
    ("lt", Operator::Lt),
    ("lte", Operator::Lte),
    ("in", Operator::In),
    ("nin", Operator::Nin),
    ("mod", Operator::Mod),
    ("all", Operator::All),
    ("size", Operator::Size),
    ("exists", Operator::Exists),
    ("contains", Operator::Contains),
    ("icontains", Operator::IContains),
    ("startswith", Operator::StartsWith),
    ("istartswith", Operator::IStartsWith),
    ("endswith", Operator::EndsWith),
    ("iendswith", Operator::IEndsWith),
    ("exact", Operator::Exact),
    ("iexact", Operator::IExact),
    ("match", Operator::Match),
    ("within_distance", Operator::WithinDistance),
    ("within_spherical_distance", Operator::WithinSphericalDistance),
    ("within_box", Operator::WithinBox),
    ("within_polygon", Operator::WithinPolygon),
    ("near", Operator::Near),
    ("near_sphere", Operator::NearSphere),
    ("max_distance", Operator::MaxDistance),
    ("geo_within", Operator::GeoWithin),
    ("geo_within_box", Operator::GeoWithinBox),
    ("geo_within_polygon", Operator::GeoWithinPolygon),
    ("geo_within_center", Operator::GeoWithinCenter),
    ("geo_within_sphere", Operator::GeoWithinSphere),
    ("geo_intersects", Operator::GeoIntersects),
];

impl Operator {
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        TABLE.iter().find(|(t, _)| *t == token).map(|(_, op)| *op)
    }

    #[must_use]
    pub fn token(self) -> &'static str {
        TABLE.iter().find(|(_, op)| *op == self).map_or("", |(t, _)| t)
    }

    #[must_use]
    pub fn family(self) -> OperatorFamily {
        use Operator as O;
        match self {
            O::Ne | O::Gt | O::Gte | O::Lt | O::Lte | O::In | O::Nin | O::Mod | O::All | O::Size | O::Exists => {
                OperatorFamily::Comparison
            }
            O::Contains
            | O::IContains
            | O::StartsWith
            | O::IStartsWith
            | O::EndsWith
            | O::IEndsWith
            | O::Exact
            | O::IExact => OperatorFamily::String,
            O::Match => OperatorFamily::Custom,
            _ => OperatorFamily::Geo,
        }
    }

    /// Only comparison operators may trail an update key (`pull: {tags__in: [...]}`).
    #[must_use]
    pub fn allowed_in_update(self) -> bool {
        self.family() == OperatorFamily::Comparison
    }

    fn wire(self) -> &'static str {
        use Operator as O;
        match self {
            O::Ne => "$ne",
            O::Gt => "$gt",
            O::Gte => "$gte",
            O::Lt => "$lt",
            O::Lte => "$lte",
            O::In => "$in",
            O::Nin => "$nin",
            O::Mod => "$mod",
            O::All => "$all",
            O::Size => "$size",
            O::Exists => "$exists",
            _ => "",
        }
    }
}

/// Builds the single-key leaf predicate `{db_key: expression}` for a resolved path.
///
/// # Errors
/// `InvalidValueShape` when the value does not fit the operator, `UnsupportedOperator`
/// when the operator does not apply to the field kind.
pub fn apply(path: &FieldPath, value: Bson) -> Result<Document, MapperError> {
    let expr = expression(path, value)?;
    let mut d = Document::new();
    d.insert(path.db_key(), expr);
    Ok(d)
}

/// The right-hand side of a leaf predicate.
pub(crate) fn expression(path: &FieldPath, value: Bson) -> Result<Bson, MapperError> {
    let field = path.field.as_ref();
    let expr = match path.operator {
        None => prepare_scalar(field, value),
        Some(op) => operator_expression(op, field, value)?,
    };
    if path.negated {
        return Ok(Bson::Document(doc! { "$not": expr }));
    }
    Ok(expr)
}

pub(crate) fn operator_expression(
    op: Operator,
    field: Option<&FieldDescriptor>,
    value: Bson,
) -> Result<Bson, MapperError> {
    match op.family() {
        OperatorFamily::Comparison => comparison(op, field, value),
        OperatorFamily::String => string_pattern(op, value),
        OperatorFamily::Custom => match value {
            Bson::Document(d) => Ok(Bson::Document(doc! { "$elemMatch": d })),
            other => Err(MapperError::shape(op.token(), format!("expected a document, got {other}"))),
        },
        OperatorFamily::Geo => geo(op, field, value),
    }
}

fn comparison(op: Operator, field: Option<&FieldDescriptor>, value: Bson) -> Result<Bson, MapperError> {
    use Operator as O;
    let value = match op {
        O::In | O::Nin | O::All => {
            let Bson::Array(items) = value else {
                return Err(MapperError::shape(op.token(), "expected a sequence"));
            };
            if items.len() > MAX_IN_SET {
                return Err(MapperError::shape(op.token(), format!("more than {MAX_IN_SET} values")));
            }
            Bson::Array(items.into_iter().map(|v| prepare_scalar(field, v)).collect())
        }
        O::Mod => {
            let ok = matches!(&value, Bson::Array(a) if a.len() == 2
                && a.iter().all(is_number)
                && as_f64(&a[0]).is_some_and(|d| d != 0.0));
            if !ok {
                return Err(MapperError::shape("mod", "expected [divisor, remainder] with a non-zero divisor"));
            }
            value
        }
        O::Size => match value {
            Bson::Int32(n) if n >= 0 => Bson::Int32(n),
            Bson::Int64(n) if n >= 0 => Bson::Int64(n),
            other => return Err(MapperError::shape("size", format!("expected a non-negative integer, got {other}"))),
        },
        O::Exists => match value {
            Bson::Boolean(b) => Bson::Boolean(b),
            other => return Err(MapperError::shape("exists", format!("expected a boolean, got {other}"))),
        },
        _ => prepare_scalar(field, value),
    };
    let mut d = Document::new();
    d.insert(op.wire(), value);
    Ok(Bson::Document(d))
}

fn string_pattern(op: Operator, value: Bson) -> Result<Bson, MapperError> {
    use Operator as O;
    let Bson::String(text) = value else {
        return Err(MapperError::shape(op.token(), "expected a string"));
    };
    let escaped = regex::escape(&text);
    let pattern = match op {
        O::Contains | O::IContains => escaped,
        O::StartsWith | O::IStartsWith => format!("^{escaped}"),
        O::EndsWith | O::IEndsWith => format!("{escaped}$"),
        _ => format!("^{escaped}$"),
    };
    let insensitive = matches!(op, O::IContains | O::IStartsWith | O::IEndsWith | O::IExact);
    let mut d = doc! { "$regex": pattern };
    if insensitive {
        d.insert("$options", "i");
    }
    Ok(Bson::Document(d))
}

fn geo(op: Operator, field: Option<&FieldDescriptor>, value: Bson) -> Result<Bson, MapperError> {
    use Operator as O;
    let kind = field.map(|f| f.kind);
    if let Some(k) = kind
        && !k.is_geo()
        && !k.is_free_form()
    {
        return Err(MapperError::UnsupportedOperator(format!("{} on a non-geo field", op.token())));
    }
    let unsupported = || MapperError::UnsupportedOperator(format!("{} for {kind:?} fields", op.token()));
    let expr = if kind == Some(FieldKind::GeoPoint) {
        match op {
            O::WithinDistance => doc! { "$within": { "$center": sequence(op, value)? } },
            O::WithinSphericalDistance => doc! { "$within": { "$centerSphere": sequence(op, value)? } },
            O::WithinPolygon => doc! { "$within": { "$polygon": sequence(op, value)? } },
            O::WithinBox => doc! { "$within": { "$box": sequence(op, value)? } },
            O::Near => doc! { "$near": sequence(op, value)? },
            O::NearSphere => doc! { "$nearSphere": sequence(op, value)? },
            O::MaxDistance => doc! { "$maxDistance": number(op, value)? },
            _ => return Err(unsupported()),
        }
    } else {
        match op {
            O::GeoWithin => doc! { "$geoWithin": infer_geometry(value)? },
            O::GeoWithinBox => doc! { "$geoWithin": { "$box": sequence(op, value)? } },
            O::GeoWithinPolygon => doc! { "$geoWithin": { "$polygon": sequence(op, value)? } },
            O::GeoWithinCenter => doc! { "$geoWithin": { "$center": sequence(op, value)? } },
            O::GeoWithinSphere => doc! { "$geoWithin": { "$centerSphere": sequence(op, value)? } },
            O::GeoIntersects => doc! { "$geoIntersects": infer_geometry(value)? },
            O::Near => doc! { "$near": infer_geometry(value)? },
            O::MaxDistance => doc! { "$maxDistance": number(op, value)? },
            _ => return Err(unsupported()),
        }
    };
    Ok(Bson::Document(expr))
}

fn sequence(op: Operator, value: Bson) -> Result<Bson, MapperError> {
    match value {
        Bson::Array(_) => Ok(value),
        other => Err(MapperError::shape(op.token(), format!("expected a coordinate sequence, got {other}"))),
    }
}

fn number(op: Operator, value: Bson) -> Result<Bson, MapperError> {
    if is_number(&value) {
        Ok(value)
    } else {
        Err(MapperError::shape(op.token(), "expected a number"))
    }
}

/// Canonicalizes raw coordinates or a GeoJSON mapping into `{"$geometry": {...}}`.
///
/// # Errors
/// `InvalidValueShape` when neither form is recognized.
pub fn infer_geometry(value: Bson) -> Result<Document, MapperError> {
    match value {
        Bson::Document(d) => {
            if d.contains_key("$geometry") {
                Ok(d)
            } else if d.contains_key("type") && d.contains_key("coordinates") {
                Ok(doc! { "$geometry": d })
            } else {
                Err(MapperError::shape("geometry", "mapping needs 'type' and 'coordinates' keys"))
            }
        }
        Bson::Array(coords) => {
            let depth = nesting_depth(&coords);
            let kind = match depth {
                3.. => "Polygon",
                2 => "LineString",
                1 if !coords.is_empty() => "Point",
                _ => return Err(MapperError::shape("geometry", "empty coordinate sequence")),
            };
            Ok(doc! { "$geometry": { "type": kind, "coordinates": coords } })
        }
        other => Err(MapperError::shape("geometry", format!("expected coordinates or a mapping, got {other}"))),
    }
}

fn nesting_depth(items: &[Bson]) -> usize {
    match items.first() {
        Some(Bson::Array(inner)) => 1 + nesting_depth(inner),
        Some(_) => 1,
        None => 0,
    }
}

/// Storage conversion for scalar operands; ObjectId fields accept hex strings.
pub(crate) fn prepare_scalar(field: Option<&FieldDescriptor>, value: Bson) -> Bson {
    match (field.map(|f| f.kind), value) {
        (Some(FieldKind::ObjectId | FieldKind::Reference), Bson::String(s)) => {
            ObjectId::parse_str(&s).map_or(Bson::String(s), Bson::ObjectId)
        }
        (_, v) => v,
    }
}

pub(crate) fn is_number(v: &Bson) -> bool {
    matches!(v, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn as_f64(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}
