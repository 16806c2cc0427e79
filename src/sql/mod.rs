//! Parameterized statements issued against the store.
//!
//! Uses the `sqlparser` crate for parsing, then narrows the result to the
//! small statement set in [`ast`] that sessions know how to execute.

mod ast;
mod error;
mod parser;

pub use ast::*;
pub use error::{ParseError, ParseResult};
pub use parser::Parser;
