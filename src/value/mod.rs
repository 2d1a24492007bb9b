mod array_value;
mod bytes_value;
mod map_value;
mod object_value;
mod value;
pub mod value_order;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use object_value::ObjectValue;
pub use value::{SentinelValue, Value, ValueKind};
pub use value_order::{canonical_id, compare_values, values_equal};
