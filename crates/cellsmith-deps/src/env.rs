//! Environment variable assignments supplied on the command line.
//!
//! Syntax: `[instance.]KEY=value`. Unscoped assignments go to the root
//! instance. Keys follow the usual shell identifier rules; the value is
//! taken verbatim and may be empty.

use std::collections::HashMap;

use cellsmith_common::error::{CellsmithError, Result};
use nom::{
    IResult, Parser,
    bytes::complete::{take_while, take_while1},
    character::complete::char,
    combinator::{all_consuming, recognize, rest},
    sequence::terminated,
};

use crate::link::{DependencyLink, scope};

/// A parsed `[instance.]KEY=value` assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAssignment {
    /// Instance receiving the variable; `None` means the root instance.
    pub instance: Option<String>,
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// Environment variables grouped by the instance receiving them.
pub type InstanceEnv = HashMap<String, Vec<(String, String)>>;

impl EnvAssignment {
    /// Parses an assignment string.
    ///
    /// # Errors
    ///
    /// Returns [`CellsmithError::InvalidInput`] if the string does not match
    /// `[instance.]KEY=value`.
    pub fn parse(input: &str) -> Result<Self> {
        let (_, (instance, key, value)) = all_consuming(assignment).parse(input).map_err(|_| {
            CellsmithError::invalid_input(format!(
                "invalid environment variable \"{input}\", expected [<instance>.]<KEY>=<value>"
            ))
        })?;
        Ok(Self {
            instance: instance.map(str::to_string),
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

const fn is_key_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_key_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn key(input: &str) -> IResult<&str, &str> {
    recognize((take_while1(is_key_start), take_while(is_key_continue))).parse(input)
}

fn assignment(input: &str) -> IResult<&str, (Option<&str>, &str, &str)> {
    (scope, terminated(key, char('=')), rest).parse(input)
}

/// Groups assignments by target instance, validating each target.
///
/// A target other than the root must be the target of one of `links`, and
/// that instance must be one that will be created by this run.
///
/// # Errors
///
/// Returns [`CellsmithError::InvalidInput`] for an unknown or already
/// running target instance.
pub fn group_environment(
    root_instance: &str,
    links: &[DependencyLink],
    assignments: Vec<EnvAssignment>,
) -> Result<InstanceEnv> {
    let mut grouped = InstanceEnv::new();
    for assignment in assignments {
        let target = assignment
            .instance
            .unwrap_or_else(|| root_instance.to_string());
        if target != root_instance {
            match links.iter().find(|link| link.target == target) {
                None => {
                    return Err(CellsmithError::invalid_input(format!(
                        "the instance of an environment variable should be provided as a \
                         dependency link, instance {target} of the environment variable {} \
                         not found",
                        assignment.key
                    )));
                }
                Some(link) if link.running => {
                    return Err(CellsmithError::invalid_input(format!(
                        "the instance of an environment variable should be an instance to be \
                         created, instance {target} is already available in the runtime"
                    )));
                }
                Some(_) => {}
            }
        }
        grouped
            .entry(target)
            .or_default()
            .push((assignment.key, assignment.value));
    }
    Ok(grouped)
}
