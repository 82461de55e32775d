// Submodules for separation of concerns
pub mod cursor;
pub mod operators;
pub mod path;
pub mod predicate;
pub mod types;
pub mod update;

pub use cursor::{Cursor, CursorIter, CursorState, GetOrCreateOptions};
pub use operators::{Operator, OperatorFamily, infer_geometry};
pub use path::{FieldPath, PathContext, Segment, resolve};
pub use predicate::{Condition, Q};
pub use types::{DELIMITER, FindOptions, Order, Projection, RAW_KEY, SortSpec};
pub use update::{Modifier, Modifiers, UpdateSpec, compile_update};
