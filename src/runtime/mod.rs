// # Value & Tuple Runtime
//
// Typed values, the binary tuple codec, list files, external sort, and
// sorted merge join. Everything above this layer moves rows through these
// types.

pub mod list_file;
pub mod merge_join;
pub mod sort;
pub mod tuple;
pub mod value;

pub use list_file::{ListFile, ListFlags, ListScan, ListScanPos, SetOpKind, LIST_PAGE_SIZE};
pub use merge_join::{merge_join, JoinType};
pub use sort::{ListSorter, SinkPut, SortConfig, SortKey, SortKeyInfo, SortPayloadKind};
pub use tuple::{decode_tuple, encode_tuple, tuple_set_value, tuple_value_at, TypeList};
pub use value::{
    arith_add, arith_div, arith_mul, arith_neg, arith_sub, sort_compare, value_compare,
    CmpResult, Domain, Value, ValueType,
};
