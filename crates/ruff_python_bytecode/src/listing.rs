//! A reader for `dis`-style instruction listings.
//!
//! Each non-empty line holds one instruction:
//!
//! ```text
//!   2           0 SETUP_LOOP              34 (to 36)
//!         >>   10 FOR_ITER                22 (to 34)
//!              36 LOAD_FAST                2 (y)
//! ```
//!
//! that is, an optional source line number, an optional `>>` jump-target
//! marker, the offset, the opcode name, an optional argument and an optional
//! parenthesized comment. When the comment has the form `(to N)`, `N` is the
//! resolved jump target; otherwise the argument is taken as already resolved.
//! Lines starting with `#` are ignored.

use crate::instruction::{mark_jump_targets, Instruction, Offset, OffsetOutOfRange, Opcode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListingError {
    #[error("line {line}: unknown opcode `{name}`")]
    UnknownOpcode { line: usize, name: String },

    #[error("line {line}: expected an offset before the opcode name")]
    MissingOffset { line: usize },

    #[error("line {line}: expected an opcode name")]
    MissingOpcode { line: usize },

    #[error("line {line}: invalid number `{text}`")]
    InvalidNumber { line: usize, text: String },

    #[error("line {line}: unexpected `{text}`")]
    UnexpectedToken { line: usize, text: String },

    #[error("line {line}: {source}")]
    OffsetOutOfRange {
        line: usize,
        source: OffsetOutOfRange,
    },

    #[error("line {line}: `{opcode}` takes no argument")]
    UnexpectedArgument { line: usize, opcode: Opcode },

    #[error("line {line}: offset {offset} does not follow offset {previous}")]
    OutOfOrder {
        line: usize,
        offset: Offset,
        previous: Offset,
    },
}

/// Parses a listing into instructions with jump-target flags set.
pub fn parse_listing(source: &str) -> Result<Vec<Instruction>, ListingError> {
    let mut instructions: Vec<Instruction> = Vec::new();

    for (index, text) in source.lines().enumerate() {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let instruction = parse_line(index + 1, text)?;

        if let Some(previous) = instructions.last() {
            if instruction.offset <= previous.offset {
                return Err(ListingError::OutOfOrder {
                    line: index + 1,
                    offset: instruction.offset,
                    previous: previous.offset,
                });
            }
        }
        instructions.push(instruction);
    }

    mark_jump_targets(&mut instructions);
    Ok(instructions)
}

fn parse_line(line: usize, text: &str) -> Result<Instruction, ListingError> {
    let (code, comment) = match text.find('(') {
        Some(start) => (&text[..start], Some(&text[start..])),
        None => (text, None),
    };

    let mut numbers: Vec<&str> = Vec::new();
    let mut tokens = code.split_whitespace().filter(|token| *token != ">>");
    let name = loop {
        let Some(token) = tokens.next() else {
            return Err(ListingError::MissingOpcode { line });
        };
        if token.bytes().all(|byte| byte.is_ascii_digit()) {
            numbers.push(token);
        } else {
            break token;
        }
    };

    // The offset is the last number before the opcode; a line number may
    // precede it.
    let offset = match numbers.as_slice() {
        [offset] | [_, offset] => parse_number(line, offset)?,
        [] => return Err(ListingError::MissingOffset { line }),
        [_, _, extra, ..] => {
            return Err(ListingError::UnexpectedToken {
                line,
                text: (*extra).to_string(),
            })
        }
    };

    let opcode = Opcode::from_name(name).ok_or_else(|| ListingError::UnknownOpcode {
        line,
        name: name.to_string(),
    })?;

    let arg = tokens
        .next()
        .map(|token| parse_number(line, token))
        .transpose()?;
    if let Some(extra) = tokens.next() {
        return Err(ListingError::UnexpectedToken {
            line,
            text: extra.to_string(),
        });
    }
    if arg.is_some() && !opcode.has_arg() {
        return Err(ListingError::UnexpectedArgument { line, opcode });
    }

    let out_of_range = |source| ListingError::OffsetOutOfRange { line, source };
    let mut instruction =
        Instruction::new(opcode, Offset::try_from(offset).map_err(out_of_range)?, arg);
    if let Some(target) = comment.and_then(jump_comment) {
        instruction = instruction.with_argval(parse_number(line, target)?);
    }
    if let (true, Some(target)) = (opcode.has_jump_target(), instruction.argval) {
        Offset::try_from(target).map_err(out_of_range)?;
    }
    Ok(instruction)
}

/// Extracts `N` from a `(to N)` comment.
fn jump_comment(comment: &str) -> Option<&str> {
    comment
        .strip_prefix("(to ")?
        .strip_suffix(')')
        .map(str::trim)
}

fn parse_number(line: usize, text: &str) -> Result<u32, ListingError> {
    text.parse().map_err(|_| ListingError::InvalidNumber {
        line,
        text: text.to_string(),
    })
}
