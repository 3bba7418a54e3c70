use std::io::BufRead;

pub mod linker;
pub mod optimizer;
pub mod program;
mod span;
pub mod tokenizer;
pub mod vm;

pub use span::Location;

use crate::{linker::DefinitionError, program::Program, tokenizer::LexError};

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Run the constant folder over the linked program.
    pub optimize: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

pub fn compile(source: &str, options: CompileOptions) -> Result<Program, CompileError> {
    compile_reader(source.as_bytes(), options)
}

/// Tokenizes the whole input before linking, so a malformed source never
/// yields a partial program.
pub fn compile_reader(reader: impl BufRead, options: CompileOptions) -> Result<Program, CompileError> {
    let tokens = tokenizer::Tokenizer::new(reader).collect::<Result<Vec<_>, _>>()?;
    let program = linker::link(tokens)?;
    if options.optimize {
        Ok(optimizer::constant_fold(&program))
    } else {
        Ok(program)
    }
}
