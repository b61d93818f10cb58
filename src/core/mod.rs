pub mod error;
pub mod types;
pub mod value;

pub use error::{InvalidParameters, PendingError, PersistenceError, Result};
pub use types::{
    AttributeDelta, AttributeMap, Column, ParentRef, attribute_delta, attributes,
    new_mutation_id,
};
pub use value::{DataType, Value};
