use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{
    program::{Instruction, Label, OpCode, Program},
    tokenizer::Token,
    vm::Value,
};

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Cannot shadow internal word definition '{0}'")]
    ShadowsBuiltin(String),
    #[error("Invalid word name '{0}'")]
    ReservedName(String),
    #[error("Word name must be a bare word, found '{0}'")]
    InvalidName(Token),
    #[error("Word '{0}' is already defined")]
    Duplicate(String),
    #[error("Expected a word name after ':'")]
    MissingName,
    #[error("Definition of '{0}' is missing its closing ';'")]
    Unterminated(String),
    #[error("Cannot define '{inner}' inside the definition of '{outer}'")]
    Nested { outer: String, inner: String },
}

/// Instruction before word references are bound to addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unlinked {
    Instruction(Instruction),
    Word(String),
}

/// Flat program whose word references are still symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlinkedProgram {
    code: Vec<Unlinked>,
    words: Vec<(String, usize)>,
}

impl UnlinkedProgram {
    pub fn code(&self) -> &[Unlinked] {
        &self.code
    }

    /// Rewrites every word reference into the address where the word begins.
    /// References are only emitted for collected words, so each one resolves.
    pub fn resolve(self) -> Program {
        let location: FxHashMap<&str, usize> = self
            .words
            .iter()
            .map(|(name, address)| (name.as_str(), *address))
            .collect();

        let code = self
            .code
            .iter()
            .map(|entry| match entry {
                Unlinked::Instruction(instruction) => instruction.clone(),
                Unlinked::Word(name) => Instruction::Push(Value::Address(location[name.as_str()])),
            })
            .collect();

        let labels = self
            .words
            .into_iter()
            .map(|(name, address)| Label { name, address })
            .collect();

        Program::with_labels(code, labels)
    }
}

/// Links a token stream into a single resolved program.
pub fn link(tokens: impl IntoIterator<Item = Token>) -> Result<Program, DefinitionError> {
    let program = translate(tokens)?.resolve();
    debug!(
        instructions = program.len(),
        words = program.labels().len(),
        "linked program"
    );
    Ok(program)
}

/// Extracts word definitions and lays out the program as the top-level body,
/// `exit`, then every word body in definition order.
pub fn translate(tokens: impl IntoIterator<Item = Token>) -> Result<UnlinkedProgram, DefinitionError> {
    let linker = Linker::collect(tokens)?;
    Ok(linker.layout())
}

struct Word {
    name: String,
    body: Vec<Token>,
}

struct Linker {
    main: Vec<Token>,
    words: Vec<Word>,
    index: FxHashMap<String, usize>,
}

impl Linker {
    fn collect(tokens: impl IntoIterator<Item = Token>) -> Result<Self, DefinitionError> {
        let mut linker = Linker {
            main: Vec::new(),
            words: Vec::new(),
            index: FxHashMap::default(),
        };

        let mut tokens = tokens.into_iter();
        while let Some(token) = tokens.next() {
            if token.is_word(":") {
                let name = linker.name(tokens.next())?;
                let body = definition_body(&name, &mut tokens)?;
                linker.index.insert(name.clone(), linker.words.len());
                linker.words.push(Word { name, body });
            } else {
                linker.main.push(token);
            }
        }

        Ok(linker)
    }

    fn name(&self, token: Option<Token>) -> Result<String, DefinitionError> {
        let name = match token {
            Some(Token::Word(name)) => name,
            Some(token) => return Err(DefinitionError::InvalidName(token)),
            None => return Err(DefinitionError::MissingName),
        };

        if name == ":" || name == ";" {
            Err(DefinitionError::ReservedName(name))
        } else if OpCode::is_builtin(&name) {
            Err(DefinitionError::ShadowsBuiltin(name))
        } else if self.index.contains_key(&name) {
            Err(DefinitionError::Duplicate(name))
        } else {
            Ok(name)
        }
    }

    fn expand(&self, body: &[Token]) -> Vec<Unlinked> {
        let mut code = Vec::with_capacity(body.len());
        for token in body {
            match token {
                Token::Word(name) if self.index.contains_key(name) => {
                    code.push(Unlinked::Word(name.clone()));
                    code.push(Unlinked::Instruction(Instruction::Op(OpCode::Call)));
                }
                token => code.push(Unlinked::Instruction(Instruction::from_token(token.clone()))),
            }
        }
        code
    }

    fn layout(self) -> UnlinkedProgram {
        let mut code = self.expand(&self.main);
        code.push(Unlinked::Instruction(Instruction::Op(OpCode::Exit)));

        let mut words = Vec::with_capacity(self.words.len());
        for word in &self.words {
            words.push((word.name.clone(), code.len()));
            code.extend(self.expand(&word.body));
            code.push(Unlinked::Instruction(Instruction::Op(OpCode::Return)));
        }

        UnlinkedProgram { code, words }
    }
}

fn definition_body(
    name: &str,
    tokens: &mut impl Iterator<Item = Token>,
) -> Result<Vec<Token>, DefinitionError> {
    let mut body = Vec::new();
    while let Some(token) = tokens.next() {
        if token.is_word(";") {
            return Ok(body);
        }
        if token.is_word(":") {
            let inner = match tokens.next() {
                Some(inner) => inner.to_string(),
                None => String::new(),
            };
            return Err(DefinitionError::Nested {
                outer: name.to_string(),
                inner,
            });
        }
        body.push(token);
    }
    Err(DefinitionError::Unterminated(name.to_string()))
}
