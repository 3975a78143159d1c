//! Query model: a chain of steps plus the collector argument bindings.

use crate::error::CommandError;

/// One step in a query path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// The class name or wildcard, e.g. `ArrayList` or `com.myco.*`.
    pub pattern: String,
    /// Optional variable name bound to this step's focus, else empty.
    pub var: String,
    /// Follow outgoing references into this step (`->`); incoming if false.
    pub outbound: bool,
    /// Whether a doubled arrow lets this step pass through skipped classes.
    pub skip: bool,
}

impl Step {
    pub fn new(pattern: String, var: String, outbound: bool, skip: bool) -> Step {
        Step {
            pattern,
            var,
            outbound,
            skip,
        }
    }
}

/// A validated query: the step chain and, for each collector argument, the
/// index of the step whose focus it takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub steps: Vec<Step>,
    pub arg_indices: Vec<usize>,
}

impl Query {
    /// Bind collector argument names to steps; every argument must name a
    /// step variable.
    pub fn new(args: Vec<String>, steps: Vec<Step>) -> Result<Query, CommandError> {
        let mut arg_indices = Vec::with_capacity(args.len());
        for arg in &args {
            match steps.iter().position(|step| step.var == *arg) {
                Some(index) => arg_indices.push(index),
                None => return Err(CommandError::UndefinedQueryVar(arg.clone())),
            }
        }
        Ok(Query { steps, arg_indices })
    }
}
