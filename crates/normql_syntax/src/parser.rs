//! Recursive descent parser for executable documents.

use crate::ast::*;
use crate::lexer::{decode_block_string, decode_string, Lexer};
use crate::token::{Token, TokenKind};
use miette::{Diagnostic as MietteDiagnostic, SourceSpan};
use normql_core::{diagnostics::codes, DiagnosticBag, Span};
use rustc_hash::FxHashSet;
use thiserror::Error;

const TYPE_SYSTEM_KEYWORDS: &[&str] = &[
    "schema",
    "scalar",
    "type",
    "interface",
    "union",
    "enum",
    "input",
    "directive",
    "extend",
];

/// Parser for executable documents.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    prev_end: u32,
    diagnostics: DiagnosticBag,
}

/// Result of parsing.
pub struct ParseResult {
    pub document: Document,
    pub diagnostics: DiagnosticBag,
}

/// A syntax error with its source, rendered by miette.
#[derive(Error, MietteDiagnostic, Debug, Clone)]
#[error("{message}")]
#[diagnostic(code(normql::syntax))]
pub struct SyntaxError {
    /// Diagnostic code from [`codes`].
    pub code: &'static str,
    pub message: String,
    #[source_code]
    pub source_code: String,
    #[label("here")]
    pub span: SourceSpan,
}

/// Parses a source string, collecting diagnostics.
pub fn parse(source: &str) -> ParseResult {
    let mut parser = Parser::new(source);
    let document = parser.parse_document();
    ParseResult {
        document,
        diagnostics: parser.diagnostics,
    }
}

/// Parses a source string, failing on the first error.
pub fn parse_query(source: &str) -> Result<Document, SyntaxError> {
    let result = parse(source);
    match result.diagnostics.first_error() {
        Some(diag) => Err(SyntaxError {
            code: diag.code,
            message: diag.message.clone(),
            source_code: source.to_string(),
            span: diag.span.into(),
        }),
        None => Ok(result.document),
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser.
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        Self {
            lexer,
            current,
            prev_end: 0,
            diagnostics: DiagnosticBag::new(),
        }
    }

    #[inline]
    fn at(&self) -> TokenKind {
        self.current.kind
    }

    #[inline]
    fn at_kind(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.at_kind(TokenKind::Name) && self.current_text() == keyword
    }

    fn advance(&mut self) {
        self.prev_end = self.current.span.end;
        self.current = self.lexer.next_token();
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at_kind(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.eat(kind) {
            true
        } else {
            self.error_expected(kind.as_str());
            false
        }
    }

    fn current_text(&self) -> &'a str {
        self.lexer.span_text(self.current.span)
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.prev_end.max(start))
    }

    fn error(&mut self, code: &'static str, message: impl Into<String>) {
        self.diagnostics.error(code, self.current.span, message);
    }

    fn error_expected(&mut self, expected: &str) {
        match self.at() {
            TokenKind::Error if self.current_text().starts_with('"') => {
                self.error(codes::UNTERMINATED_STRING, "unterminated string");
            }
            TokenKind::Eof => {
                self.error(
                    codes::UNEXPECTED_EOF,
                    format!("expected {expected}, found end of input"),
                );
            }
            TokenKind::Name => {
                let found = self.current_text();
                self.error(
                    codes::UNEXPECTED_TOKEN,
                    format!("expected {expected}, found `{found}`"),
                );
            }
            kind => {
                self.error(
                    codes::UNEXPECTED_TOKEN,
                    format!("expected {expected}, found {kind}"),
                );
            }
        }
    }

    fn expect_name(&mut self) -> Option<String> {
        if self.at_kind(TokenKind::Name) {
            let name = self.current_text().to_string();
            self.advance();
            Some(name)
        } else {
            self.error_expected("a name");
            None
        }
    }

    /// Parses a document.
    pub fn parse_document(&mut self) -> Document {
        let start = self.current.span.start;
        let mut definitions = Vec::new();
        let mut fragment_names = FxHashSet::default();

        while !self.at_kind(TokenKind::Eof) {
            let before = self.current.span.start;
            match self.parse_definition() {
                Some(Definition::Fragment(frag)) => {
                    if !fragment_names.insert(frag.name.clone()) {
                        self.diagnostics.error(
                            codes::DUPLICATE_FRAGMENT,
                            frag.span,
                            format!("fragment `{}` is defined more than once", frag.name),
                        );
                    }
                    definitions.push(Definition::Fragment(frag));
                }
                Some(def) => definitions.push(def),
                // Recovery: make progress, then try the next definition
                None if self.current.span.start == before => self.advance(),
                None => {}
            }
        }

        Document {
            definitions,
            span: Span::new(start, self.current.span.end),
        }
    }

    fn parse_definition(&mut self) -> Option<Definition> {
        match self.at() {
            TokenKind::LBrace => {
                let start = self.current.span.start;
                let selection_set = self.parse_selection_set()?;
                Some(Definition::Operation(OperationDefinition {
                    operation: OperationType::Query,
                    name: None,
                    variables: Vec::new(),
                    directives: Vec::new(),
                    selection_set,
                    span: self.span_from(start),
                }))
            }
            TokenKind::Name => {
                let text = self.current_text();
                if let Some(operation) = OperationType::from_keyword(text) {
                    self.parse_operation(operation).map(Definition::Operation)
                } else if text == "fragment" {
                    self.parse_fragment().map(Definition::Fragment)
                } else if TYPE_SYSTEM_KEYWORDS.contains(&text) {
                    self.skip_type_definition();
                    None
                } else {
                    self.error_expected("an operation or fragment");
                    None
                }
            }
            TokenKind::StringLiteral | TokenKind::BlockStringLiteral => {
                // Descriptions only precede type-system definitions.
                self.skip_type_definition();
                None
            }
            _ => {
                self.error_expected("an operation or fragment");
                None
            }
        }
    }

    /// Reports a type-system definition and skips past its body.
    fn skip_type_definition(&mut self) {
        self.error(
            codes::TYPE_DEFINITION,
            "type-system definitions are not supported in executable documents",
        );
        self.advance();
        let mut depth = 0usize;
        loop {
            match self.at() {
                TokenKind::Eof => return,
                TokenKind::Name
                    if depth == 0
                        && (self.at_keyword("fragment")
                            || OperationType::from_keyword(self.current_text()).is_some()) =>
                {
                    return;
                }
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.advance();
                        return;
                    }
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn parse_operation(&mut self, operation: OperationType) -> Option<OperationDefinition> {
        let start = self.current.span.start;
        self.advance();

        let name = if self.at_kind(TokenKind::Name) {
            self.expect_name()
        } else {
            None
        };
        let variables = self.parse_variable_definitions()?;
        let directives = self.parse_directives()?;
        let selection_set = self.parse_selection_set()?;

        Some(OperationDefinition {
            operation,
            name,
            variables,
            directives,
            selection_set,
            span: self.span_from(start),
        })
    }

    fn parse_variable_definitions(&mut self) -> Option<Vec<VariableDefinition>> {
        let mut variables = Vec::new();
        if !self.eat(TokenKind::LParen) {
            return Some(variables);
        }

        while !self.at_kind(TokenKind::RParen) {
            let start = self.current.span.start;
            if !self.expect(TokenKind::Dollar) {
                return None;
            }
            let name = self.expect_name()?;
            if !self.expect(TokenKind::Colon) {
                return None;
            }
            let ty = self.parse_type()?;
            let default_value = if self.eat(TokenKind::Eq) {
                Some(self.parse_value(true)?)
            } else {
                None
            };
            // Variable directives carry no cache semantics.
            self.parse_directives()?;
            variables.push(VariableDefinition {
                name,
                ty,
                default_value,
                span: self.span_from(start),
            });
        }
        self.advance();

        Some(variables)
    }

    fn parse_type(&mut self) -> Option<Type> {
        let ty = if self.eat(TokenKind::LBracket) {
            let inner = self.parse_type()?;
            if !self.expect(TokenKind::RBracket) {
                return None;
            }
            Type::List(Box::new(inner))
        } else {
            Type::Named(self.expect_name()?)
        };

        if self.eat(TokenKind::Bang) {
            Some(Type::NonNull(Box::new(ty)))
        } else {
            Some(ty)
        }
    }

    fn parse_directives(&mut self) -> Option<Vec<Directive>> {
        let mut directives = Vec::new();
        while self.at_kind(TokenKind::At) {
            let start = self.current.span.start;
            self.advance();
            let name = self.expect_name()?;
            let arguments = self.parse_arguments()?;
            directives.push(Directive {
                name,
                arguments,
                span: self.span_from(start),
            });
        }
        Some(directives)
    }

    fn parse_arguments(&mut self) -> Option<Vec<Argument>> {
        let mut arguments = Vec::new();
        if !self.eat(TokenKind::LParen) {
            return Some(arguments);
        }

        while !self.at_kind(TokenKind::RParen) {
            let start = self.current.span.start;
            let name = self.expect_name()?;
            if !self.expect(TokenKind::Colon) {
                return None;
            }
            let value = self.parse_value(false)?;
            arguments.push(Argument {
                name,
                value,
                span: self.span_from(start),
            });
        }
        self.advance();

        Some(arguments)
    }

    fn parse_value(&mut self, is_const: bool) -> Option<Value> {
        let text = self.current_text();
        let value = match self.at() {
            TokenKind::Dollar => {
                if is_const {
                    self.error(
                        codes::INVALID_SYNTAX,
                        "variables are not allowed in default values",
                    );
                    return None;
                }
                self.advance();
                return self.expect_name().map(Value::Variable);
            }
            TokenKind::IntLiteral => match text.parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => {
                    self.error(codes::INVALID_SYNTAX, format!("integer `{text}` is out of range"));
                    return None;
                }
            },
            TokenKind::FloatLiteral => match text.parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => {
                    self.error(codes::INVALID_SYNTAX, format!("invalid float `{text}`"));
                    return None;
                }
            },
            TokenKind::StringLiteral => match decode_string(text) {
                Ok(s) => Value::String(s),
                Err(message) => {
                    self.error(codes::INVALID_ESCAPE, message);
                    return None;
                }
            },
            TokenKind::BlockStringLiteral => Value::String(decode_block_string(text)),
            TokenKind::Name => match text {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                "null" => Value::Null,
                _ => Value::Enum(text.to_string()),
            },
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.at_kind(TokenKind::RBracket) {
                    if self.at_kind(TokenKind::Eof) {
                        self.error_expected("`]`");
                        return None;
                    }
                    items.push(self.parse_value(is_const)?);
                }
                self.advance();
                return Some(Value::List(items));
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                while !self.at_kind(TokenKind::RBrace) {
                    let name = self.expect_name()?;
                    if !self.expect(TokenKind::Colon) {
                        return None;
                    }
                    fields.push((name, self.parse_value(is_const)?));
                }
                self.advance();
                return Some(Value::Object(fields));
            }
            _ => {
                self.error_expected("a value");
                return None;
            }
        };
        self.advance();
        Some(value)
    }

    fn parse_selection_set(&mut self) -> Option<SelectionSet> {
        let start = self.current.span.start;
        if !self.expect(TokenKind::LBrace) {
            return None;
        }

        let mut selections = Vec::new();
        while !self.at_kind(TokenKind::RBrace) {
            if self.at_kind(TokenKind::Eof) {
                self.error_expected("`}`");
                return None;
            }
            selections.push(self.parse_selection()?);
        }
        self.advance();

        let span = self.span_from(start);
        if selections.is_empty() {
            self.diagnostics
                .error(codes::INVALID_SYNTAX, span, "selection set cannot be empty");
        }

        Some(SelectionSet { selections, span })
    }

    fn parse_selection(&mut self) -> Option<Selection> {
        if !self.at_kind(TokenKind::Spread) {
            return self.parse_field().map(Selection::Field);
        }

        let start = self.current.span.start;
        self.advance();

        if self.at_kind(TokenKind::Name) && !self.at_keyword("on") {
            let name = self.expect_name()?;
            let directives = self.parse_directives()?;
            return Some(Selection::FragmentSpread(FragmentSpread {
                name,
                directives,
                span: self.span_from(start),
            }));
        }

        let type_condition = if self.at_keyword("on") {
            self.advance();
            Some(self.expect_name()?)
        } else {
            None
        };
        let directives = self.parse_directives()?;
        let selection_set = self.parse_selection_set()?;

        Some(Selection::InlineFragment(InlineFragment {
            type_condition,
            directives,
            selection_set,
            span: self.span_from(start),
        }))
    }

    fn parse_field(&mut self) -> Option<Field> {
        let start = self.current.span.start;
        let first = self.expect_name()?;

        let (alias, name) = if self.eat(TokenKind::Colon) {
            (Some(first), self.expect_name()?)
        } else {
            (None, first)
        };

        let arguments = self.parse_arguments()?;
        let directives = self.parse_directives()?;
        let selection_set = if self.at_kind(TokenKind::LBrace) {
            Some(self.parse_selection_set()?)
        } else {
            None
        };

        Some(Field {
            alias,
            name,
            arguments,
            directives,
            selection_set,
            span: self.span_from(start),
        })
    }

    fn parse_fragment(&mut self) -> Option<FragmentDefinition> {
        let start = self.current.span.start;
        self.advance();

        if self.at_keyword("on") {
            self.error(codes::INVALID_SYNTAX, "a fragment cannot be named `on`");
            return None;
        }
        let name = self.expect_name()?;

        if !self.at_keyword("on") {
            self.error_expected("`on`");
            return None;
        }
        self.advance();
        let type_condition = self.expect_name()?;
        let directives = self.parse_directives()?;
        let selection_set = self.parse_selection_set()?;

        Some(FragmentDefinition {
            name,
            type_condition,
            directives,
            selection_set,
            span: self.span_from(start),
        })
    }
}
