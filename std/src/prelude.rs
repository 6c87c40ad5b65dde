pub use crate::blocks::{
    Collect, Concat, Count, First, Flatten, ForEach, JoinStrings, Map, Slice, SplitString,
};
pub use crate::category::BlockCategory;
pub use crate::register_standard_blocks;
