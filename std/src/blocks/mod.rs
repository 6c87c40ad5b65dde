mod lists;
mod map;
mod strings;

pub use lists::{Collect, Count, First, Flatten, ForEach, Slice};
pub use map::Map;
pub use strings::{Concat, JoinStrings, SplitString};

fn unknown_function(block: &str, function: &str) -> anyhow::Error {
    anyhow::anyhow!("{block} has no function '{function}'")
}
