//! Modelfile parsing.
//!
//! A Modelfile is a directive-oriented text file, one directive per line:
//!
//! ```text
//! FROM ./model.gguf
//! TEMPLATE "[INST] {{ .Prompt }} [/INST]"
//! PARAMETER stop [/INST]
//! PARAMETER temperature 0.7
//! ```
//!
//! `#` comment lines and blank lines are ignored, a trailing `\` continues
//! the directive on the next line, and operands are lexed shell-style:
//! double quotes preserve interior whitespace and a backslash escapes the
//! next character. Directives are case-sensitive.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown directive {directive:?} on line {line}")]
    UnknownDirective { directive: String, line: usize },

    #[error("{directive} expects {expected} operand(s), found {found} on line {line}")]
    OperandCount {
        directive: &'static str,
        expected: usize,
        found: usize,
        line: usize,
    },

    #[error("unterminated quoted string on line {line}")]
    UnterminatedString { line: usize },

    #[error("duplicate {directive} directive on line {line}")]
    DuplicateDirective {
        directive: &'static str,
        line: usize,
    },

    #[error("modelfile does not contain a FROM directive")]
    MissingFrom,

    #[error("unable to read modelfile: {0}")]
    Io(#[from] std::io::Error),
}

/// One planned layer of the assembled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSpec {
    /// File reference to the model weights, relative to the build context.
    From { path: String },
    /// Inline prompt template.
    Template { text: String },
    /// Accumulated sampler parameters: insertion-ordered keys, values
    /// accumulate per key across PARAMETER lines.
    Parameters { params: Vec<(String, Vec<String>)> },
}

/// The ordered layer plan produced from a Modelfile.
///
/// Declaration order is preserved; the parameters spec sits at the
/// position of the first PARAMETER directive.
#[derive(Debug, Clone, Default)]
pub struct LayerPlan {
    specs: Vec<LayerSpec>,
}

impl LayerPlan {
    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }
}

pub fn parse_file(path: impl AsRef<Path>) -> Result<LayerPlan, ParseError> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(input: &str) -> Result<LayerPlan, ParseError> {
    let mut specs: Vec<LayerSpec> = Vec::new();
    let mut from_line: Option<usize> = None;
    let mut template_line: Option<usize> = None;
    let mut params_index: Option<usize> = None;

    let mut lines = input.lines().enumerate();
    while let Some((idx, raw)) = lines.next() {
        let line_no = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // Fold continuation lines into one logical directive line.
        let mut logical = raw.to_string();
        while logical.trim_end().ends_with('\\') {
            let without = logical.trim_end();
            logical = without[..without.len() - 1].to_string();
            match lines.next() {
                Some((_, next)) => logical.push_str(next),
                None => break,
            }
        }

        let mut words = split_words(&logical, line_no)?;
        if words.is_empty() {
            continue;
        }
        let directive = words.remove(0);

        match directive.as_str() {
            "FROM" => {
                if from_line.is_some() {
                    return Err(ParseError::DuplicateDirective {
                        directive: "FROM",
                        line: line_no,
                    });
                }
                if words.len() != 1 {
                    return Err(ParseError::OperandCount {
                        directive: "FROM",
                        expected: 1,
                        found: words.len(),
                        line: line_no,
                    });
                }
                from_line = Some(line_no);
                specs.push(LayerSpec::From {
                    path: words.remove(0),
                });
            }
            "TEMPLATE" => {
                if template_line.is_some() {
                    return Err(ParseError::DuplicateDirective {
                        directive: "TEMPLATE",
                        line: line_no,
                    });
                }
                if words.len() != 1 {
                    return Err(ParseError::OperandCount {
                        directive: "TEMPLATE",
                        expected: 1,
                        found: words.len(),
                        line: line_no,
                    });
                }
                template_line = Some(line_no);
                specs.push(LayerSpec::Template {
                    text: words.remove(0),
                });
            }
            "PARAMETER" => {
                if words.len() != 2 {
                    return Err(ParseError::OperandCount {
                        directive: "PARAMETER",
                        expected: 2,
                        found: words.len(),
                        line: line_no,
                    });
                }
                let value = words.pop().expect("two operands");
                let key = words.pop().expect("two operands");

                let index = *params_index.get_or_insert_with(|| {
                    specs.push(LayerSpec::Parameters { params: Vec::new() });
                    specs.len() - 1
                });
                let LayerSpec::Parameters { params } = &mut specs[index] else {
                    unreachable!("parameters index always points at a parameters spec");
                };
                match params.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, values)) => values.push(value),
                    None => params.push((key, vec![value])),
                }
            }
            other => {
                return Err(ParseError::UnknownDirective {
                    directive: other.to_string(),
                    line: line_no,
                });
            }
        }
    }

    if from_line.is_none() {
        return Err(ParseError::MissingFrom);
    }

    Ok(LayerPlan { specs })
}

/// Split a directive line into words: whitespace-separated, double quotes
/// keep interior whitespace, backslash escapes the following character.
fn split_words(line: &str, line_no: usize) -> Result<Vec<String>, ParseError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_quotes = false;

    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => current.push('\\'),
                }
            }
            '"' => {
                in_word = true;
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_quotes {
        return Err(ParseError::UnterminatedString { line: line_no });
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
