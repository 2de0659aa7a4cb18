// Template pipeline: lex, parse, resolve inheritance, compile, render

pub mod ast;
pub mod compiler;
pub mod condition;
pub mod expr;
pub mod inheritance;
pub mod lexer;
pub mod parser;
pub mod renderer;

pub use ast::{ParsedTemplate, ResolvedTemplate, SourceSegment, TemplateSource};
pub use compiler::{DirectiveCompiler, ExecutableUnit, Instruction, Op, SourceLocation, SourceMap};
pub use expr::{Operand, VarPath};
pub use inheritance::{InheritanceResolver, TemplateLoader};
pub use parser::TemplateParser;
pub use renderer::{IncludeResolver, Renderer};
