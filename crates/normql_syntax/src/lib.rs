//! Executable-document syntax for normql.
//!
//! This crate provides:
//! - `token`: Token kinds and token structures
//! - `lexer`: Tokenization
//! - `ast`: Owned AST for operations and fragments
//! - `parser`: Recursive descent parser
//! - `printer`: Canonical document printing
//! - `transform`: Operation/fragment selection, directives, `__typename` insertion

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod token;
pub mod transform;

pub use ast::*;
pub use lexer::Lexer;
pub use parser::{parse, parse_query, ParseResult, SyntaxError};
pub use printer::{print, print_selection_set, PrintOptions, Printer};
pub use token::{Token, TokenKind};
pub use transform::{
    add_typename_to_document, create_fragment_map, get_fragment_query_document,
    get_operation_definition, should_include, variables_with_defaults, FragmentMap,
    TYPENAME_FIELD,
};
