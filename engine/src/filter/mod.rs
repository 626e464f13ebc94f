mod compiler;
mod types;

pub use compiler::{all_of, any_of, FilterCompiler};
pub(crate) use compiler::{range, wrap_nested};
pub use types::{FilterExpr, Operator};
