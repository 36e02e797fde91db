//! Canonical printing of executable documents.
//!
//! The printed form is stable for a given AST, so it doubles as the query
//! part of request fingerprints.

use crate::ast::*;

/// Printer options.
#[derive(Debug, Clone)]
pub struct PrintOptions {
    /// Number of spaces for indentation.
    pub indent_size: usize,
}

impl Default for PrintOptions {
    fn default() -> Self {
        Self { indent_size: 2 }
    }
}

/// Document printer.
pub struct Printer {
    options: PrintOptions,
    output: String,
    indent: usize,
}

/// Prints a document with default options.
pub fn print(document: &Document) -> String {
    Printer::new(PrintOptions::default()).print(document)
}

/// Prints a selection set on its own.
pub fn print_selection_set(selection_set: &SelectionSet) -> String {
    let mut printer = Printer::new(PrintOptions::default());
    printer.print_selection_set(selection_set);
    printer.output
}

impl Printer {
    /// Creates a new printer.
    pub fn new(options: PrintOptions) -> Self {
        Self {
            options,
            output: String::new(),
            indent: 0,
        }
    }

    /// Prints a document.
    pub fn print(&mut self, document: &Document) -> String {
        self.output.clear();

        for (i, def) in document.definitions.iter().enumerate() {
            if i > 0 {
                self.output.push_str("\n\n");
            }
            match def {
                Definition::Operation(op) => self.print_operation(op),
                Definition::Fragment(frag) => self.print_fragment(frag),
            }
        }

        std::mem::take(&mut self.output)
    }

    fn push_indent(&mut self) {
        for _ in 0..self.indent * self.options.indent_size {
            self.output.push(' ');
        }
    }

    fn print_operation(&mut self, op: &OperationDefinition) {
        let is_shorthand = op.operation == OperationType::Query
            && op.name.is_none()
            && op.variables.is_empty()
            && op.directives.is_empty();

        if !is_shorthand {
            self.output.push_str(op.operation.as_str());
            if let Some(name) = &op.name {
                self.output.push(' ');
                self.output.push_str(name);
            }
            if !op.variables.is_empty() {
                self.output.push('(');
                for (i, var) in op.variables.iter().enumerate() {
                    if i > 0 {
                        self.output.push_str(", ");
                    }
                    self.output.push('$');
                    self.output.push_str(&var.name);
                    self.output.push_str(": ");
                    self.output.push_str(&var.ty.to_string());
                    if let Some(default) = &var.default_value {
                        self.output.push_str(" = ");
                        self.print_value(default);
                    }
                }
                self.output.push(')');
            }
            self.print_directives(&op.directives);
            self.output.push(' ');
        }

        self.print_selection_set(&op.selection_set);
    }

    fn print_fragment(&mut self, frag: &FragmentDefinition) {
        self.output.push_str("fragment ");
        self.output.push_str(&frag.name);
        self.output.push_str(" on ");
        self.output.push_str(&frag.type_condition);
        self.print_directives(&frag.directives);
        self.output.push(' ');
        self.print_selection_set(&frag.selection_set);
    }

    fn print_selection_set(&mut self, selection_set: &SelectionSet) {
        self.output.push_str("{\n");
        self.indent += 1;
        for selection in &selection_set.selections {
            self.push_indent();
            self.print_selection(selection);
            self.output.push('\n');
        }
        self.indent -= 1;
        self.push_indent();
        self.output.push('}');
    }

    fn print_selection(&mut self, selection: &Selection) {
        match selection {
            Selection::Field(field) => {
                if let Some(alias) = &field.alias {
                    self.output.push_str(alias);
                    self.output.push_str(": ");
                }
                self.output.push_str(&field.name);
                self.print_arguments(&field.arguments);
                self.print_directives(&field.directives);
                if let Some(selection_set) = &field.selection_set {
                    self.output.push(' ');
                    self.print_selection_set(selection_set);
                }
            }
            Selection::FragmentSpread(spread) => {
                self.output.push_str("...");
                self.output.push_str(&spread.name);
                self.print_directives(&spread.directives);
            }
            Selection::InlineFragment(inline) => {
                self.output.push_str("...");
                if let Some(type_condition) = &inline.type_condition {
                    self.output.push_str(" on ");
                    self.output.push_str(type_condition);
                }
                self.print_directives(&inline.directives);
                self.output.push(' ');
                self.print_selection_set(&inline.selection_set);
            }
        }
    }

    fn print_arguments(&mut self, arguments: &[Argument]) {
        if arguments.is_empty() {
            return;
        }
        self.output.push('(');
        for (i, arg) in arguments.iter().enumerate() {
            if i > 0 {
                self.output.push_str(", ");
            }
            self.output.push_str(&arg.name);
            self.output.push_str(": ");
            self.print_value(&arg.value);
        }
        self.output.push(')');
    }

    fn print_directives(&mut self, directives: &[Directive]) {
        for directive in directives {
            self.output.push_str(" @");
            self.output.push_str(&directive.name);
            self.print_arguments(&directive.arguments);
        }
    }

    fn print_value(&mut self, value: &Value) {
        match value {
            Value::Variable(name) => {
                self.output.push('$');
                self.output.push_str(name);
            }
            Value::Int(i) => self.output.push_str(&i.to_string()),
            Value::Float(f) => self.output.push_str(&format!("{f:?}")),
            Value::String(s) => {
                let quoted = serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""));
                self.output.push_str(&quoted);
            }
            Value::Boolean(b) => self.output.push_str(if *b { "true" } else { "false" }),
            Value::Null => self.output.push_str("null"),
            Value::Enum(name) => self.output.push_str(name),
            Value::List(items) => {
                self.output.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.output.push_str(", ");
                    }
                    self.print_value(item);
                }
                self.output.push(']');
            }
            Value::Object(fields) => {
                self.output.push('{');
                for (i, (name, item)) in fields.iter().enumerate() {
                    if i > 0 {
                        self.output.push_str(", ");
                    }
                    self.output.push_str(name);
                    self.output.push_str(": ");
                    self.print_value(item);
                }
                self.output.push('}');
            }
        }
    }
}
