#![allow(dead_code)]

use std::sync::Arc;

use docmapper::Database;
use docmapper::schema::{FieldDescriptor as F, FieldKind as K, SchemaDescriptor, SchemaRegistry};
use docmapper::transport::{MemoryTransport, Transport};

pub fn registry() -> SchemaRegistry {
    let mut reg = SchemaRegistry::new();
    reg.register(
        SchemaDescriptor::new("Person")
            .field(F::new("name", K::String))
            .field(F::new("age", K::Int))
            .field(F::new("email", K::String).with_db_field("mail")),
    )
    .unwrap();
    reg.register(
        SchemaDescriptor::embedded_type("Comment")
            .field(F::new("by", K::String))
            .field(F::new("text", K::String))
            .field(F::new("votes", K::Int)),
    )
    .unwrap();
    reg.register(
        SchemaDescriptor::embedded_type("Author")
            .field(F::new("name", K::String))
            .field(F::new("email", K::String)),
    )
    .unwrap();
    reg.register(
        SchemaDescriptor::new("BlogPost")
            .field(F::new("title", K::String))
            .field(F::new("published", K::Bool))
            .field(F::new("publish_date", K::DateTime))
            .field(F::new("page_views", K::Int))
            .field(F::new("rating", K::Float).with_db_field("r"))
            .field(F::new("tags", K::String).list())
            .field(F::embedded("author", "Author"))
            .field(F::embedded("comments", "Comment").list())
            .field(F::new("meta", K::Dict))
            .field(F::new("owner", K::Reference))
            .field(F::new("location", K::GeoPoint))
            .field(F::new("point", K::Point))
            .field(F::new("area", K::Polygon)),
    )
    .unwrap();
    reg
}

pub fn memory() -> Arc<MemoryTransport> {
    Arc::new(MemoryTransport::new())
}

pub fn database(transport: &Arc<MemoryTransport>) -> Database {
    let t: Arc<dyn Transport> = transport.clone();
    Database::new(registry(), t)
}
