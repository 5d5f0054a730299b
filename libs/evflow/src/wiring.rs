// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Wiring attribute parsing.
//!
//! `moduleInput` is a whitespace-separated list of per-producer clauses:
//!
//! ```text
//! input    := producer (WS producer)*
//! producer := uint '[' typeSpec (',' typeSpec)* ']'
//! typeSpec := uint ( 'a' uint )?      // optional "after module" tap point
//! ```
//!
//! `"1[1,2,3] 2[2] 4[1a7,2]"` means: types 1,2,3 from module 1; type 2
//! from module 2; from module 4 type 1 tapped after module 7 modified it
//! and type 2 from the original producer.
//!
//! `moduleOutput` is a comma-separated list of non-negative type IDs, used
//! only by modules whose descriptor declares a wildcard output type.
//!
//! Parsing here is purely grammatical; cross-module checks (referenced
//! IDs exist, streams are producible, tap points are valid) live in the
//! plan builder, which has the module table at hand.

use std::collections::BTreeMap;

use thiserror::Error;

/// One parsed input: a type from a producer, tapped at a point in the
/// stream's pipeline (`after_module_id == -1` taps the original producer).
/// `copy_needed` is inferred afterwards from the consumer's declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderedInput {
    pub type_id: i16,
    pub after_module_id: i16,
    pub copy_needed: bool,
}

impl OrderedInput {
    fn new(type_id: i16, after_module_id: i16) -> Self {
        Self {
            type_id,
            after_module_id,
            copy_needed: false,
        }
    }
}

/// Grammar-level parse failure. The plan builder wraps these with the
/// offending module's name and attribute.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}")]
    Grammar(String),
    #[error("duplicate referenced module ID {0} found")]
    DuplicateProducer(i16),
}

fn grammar(msg: impl Into<String>) -> ParseError {
    ParseError::Grammar(msg.into())
}

fn parse_id(s: &str, what: &str) -> Result<i16, ParseError> {
    let value: i32 = s
        .parse()
        .map_err(|_| grammar(format!("malformed {what} '{s}'")))?;

    if value < 0 || value > i16::MAX as i32 {
        return Err(grammar(format!("{what} negative or too big")));
    }

    Ok(value as i16)
}

fn parse_type_spec(spec: &str) -> Result<OrderedInput, ParseError> {
    if spec.is_empty() {
        return Err(grammar("empty type specification"));
    }

    match spec.split_once('a') {
        None => Ok(OrderedInput::new(parse_id(spec, "type ID")?, -1)),
        Some((type_str, after_str)) => {
            let type_id = parse_id(type_str, "type ID")?;
            let after_module_id = parse_id(after_str, "after-module ID")?;
            Ok(OrderedInput::new(type_id, after_module_id))
        }
    }
}

fn parse_producer_clause(clause: &str) -> Result<(i16, Vec<OrderedInput>), ParseError> {
    let Some((id_str, rest)) = clause.split_once('[') else {
        return Err(grammar(format!("malformed input definition '{clause}'")));
    };

    let Some(types_str) = rest.strip_suffix(']') else {
        return Err(grammar(format!("malformed input definition '{clause}'")));
    };

    let source_id = parse_id(id_str, "referenced module ID")?;

    let mut inputs = Vec::new();
    for spec in types_str.split(',') {
        inputs.push(parse_type_spec(spec)?);
    }

    if inputs.is_empty() {
        return Err(grammar("empty extracted type ID list"));
    }

    // The same (type, tap point) pair twice would make packets inside the
    // module indistinguishable.
    inputs.sort_by_key(|o| (o.type_id, o.after_module_id));
    let len_before = inputs.len();
    inputs.dedup_by_key(|o| (o.type_id, o.after_module_id));
    if inputs.len() != len_before {
        return Err(grammar("duplicate type ID found"));
    }

    Ok((source_id, inputs))
}

/// Parse a `moduleInput` attribute into per-producer input sequences.
pub fn parse_module_input(
    definition: &str,
) -> Result<BTreeMap<i16, Vec<OrderedInput>>, ParseError> {
    if definition.is_empty() {
        return Err(grammar("empty 'moduleInput' attribute"));
    }

    let mut result = BTreeMap::new();

    for clause in definition.split_whitespace() {
        let (source_id, inputs) = parse_producer_clause(clause)?;

        // Multiple clauses for the same producer are not allowed.
        if result.insert(source_id, inputs).is_some() {
            return Err(ParseError::DuplicateProducer(source_id));
        }
    }

    if result.is_empty() {
        return Err(grammar("empty extracted input definition"));
    }

    Ok(result)
}

/// Parse a `moduleOutput` attribute into a sorted list of type IDs.
pub fn parse_module_output(definition: &str) -> Result<Vec<i16>, ParseError> {
    if definition.is_empty() {
        return Err(grammar("empty 'moduleOutput' attribute"));
    }

    let mut types = Vec::new();
    for part in definition.split(',') {
        types.push(parse_id(part, "type ID")?);
    }

    types.sort_unstable();
    let len_before = types.len();
    types.dedup();
    if types.len() != len_before {
        return Err(grammar("duplicate type ID found"));
    }

    Ok(types)
}

/// Count connected inputs per type and compare against the module's
/// declared input streams. Returns a human-readable reason on mismatch.
pub fn check_input_cardinality(
    parsed: &BTreeMap<i16, Vec<OrderedInput>>,
    declared: &[crate::module::InputStreamDecl],
) -> Result<(), String> {
    let mut type_count: BTreeMap<i16, i16> = BTreeMap::new();
    for inputs in parsed.values() {
        for input in inputs {
            *type_count.entry(input.type_id).or_insert(0) += 1;
        }
    }

    // Any-type/any-number: there just needs to be something.
    if declared.len() == 1 && declared[0].type_id == -1 && declared[0].number == -1 {
        if type_count.is_empty() {
            return Err("any-type/any-number definition has no connected input streams".into());
        }
        return Ok(());
    }

    // Any-type/1: exactly one connected input of exactly one type.
    if declared.len() == 1 && declared[0].type_id == -1 && declared[0].number == 1 {
        if type_count.len() != 1 || *type_count.values().next().unwrap() != 1 {
            return Err(
                "any-type/1 definition requires exactly one connected input stream of some type"
                    .into(),
            );
        }
        return Ok(());
    }

    // Defined types: the set of connected types must match the set of
    // declared types exactly (declarations are strictly monotonic, so
    // comparing counts suffices for the set check).
    if type_count.len() != declared.len() {
        return Err(
            "defined-type definitions require as many connected different types as declared"
                .into(),
        );
    }

    for decl in declared {
        let count = type_count.get(&decl.type_id).copied().unwrap_or(0);

        if decl.number == -1 && count < 1 {
            return Err(format!(
                "defined-type/any-number definition requires at least one connected input stream of type {}",
                decl.type_id
            ));
        }

        if decl.number > 0 && count != decl.number {
            return Err(format!(
                "defined-type/defined-number definition requires exactly {} connected input stream(s) of type {}, got {}",
                decl.number, decl.type_id, count
            ));
        }
    }

    Ok(())
}

/// Mark `copy_needed` on every parsed input whose declaration is not
/// read-only. A writable wildcard declaration applies to all inputs.
pub fn apply_copy_needed(
    parsed: &mut BTreeMap<i16, Vec<OrderedInput>>,
    declared: &[crate::module::InputStreamDecl],
) {
    for decl in declared {
        if decl.read_only {
            continue;
        }

        for inputs in parsed.values_mut() {
            for input in inputs.iter_mut() {
                if decl.type_id == -1 || input.type_id == decl.type_id {
                    input.copy_needed = true;
                }
            }
        }
    }
}
