//! The interactive command grammar.
//!
//! Commands are parsed with combinators over the input line:
//!
//! ```text
//! histo v1, v2, ... of <step> (-> | <- | ->> | <<-) <step> ...
//! set threshold <size> (objects|bytes|retained)
//! set nothreshold
//! set garbage [only] | set nogarbage
//! set skip <class-pattern> | set noskip <class-pattern>
//! ```
//!
//! A `<step>` is a class pattern with an optional variable binding, e.g.
//! `com.acme.Foo x`. Size literals take `k`/`m`/`g` suffixes (powers of
//! 1024).

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{char, digit1, multispace0, multispace1, one_of, satisfy};
use nom::combinator::{all_consuming, map, map_res, opt, recognize, value};
use nom::multi::{many0, many1, separated_list1};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use crate::error::CommandError;
use crate::gcroots::Visibility;
use crate::query::{Query, Step};

/// Threshold dimension for `set threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdDim {
    Objects,
    Bytes,
    Retained,
}

/// A parsed, validated console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Histo(Query),
    SetThreshold { value: u64, dim: ThresholdDim },
    SetNoThreshold,
    SetGarbage(Visibility),
    SetSkip { pattern: String, skip: bool },
}

/// Parse one console line. Grammar failures become
/// [`CommandError::Syntax`]; a `histo` whose collector arguments don't
/// bind to path variables becomes [`CommandError::UndefinedQueryVar`].
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let (_, raw) = all_consuming(delimited(multispace0, raw_command, multispace0))(line)
        .map_err(|_| CommandError::Syntax)?;
    match raw {
        RawCommand::Histo { args, steps } => Ok(Command::Histo(Query::new(args, steps)?)),
        RawCommand::Direct(command) => Ok(command),
    }
}

enum RawCommand {
    Histo { args: Vec<String>, steps: Vec<Step> },
    Direct(Command),
}

fn raw_command(input: &str) -> IResult<&str, RawCommand> {
    alt((histo_command, map(set_command, RawCommand::Direct)))(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == '$'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
    ))(input)
}

/// Matches e.g. `Integer`, `com.myco.*`, `long[][]`.
fn class_name(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        identifier,
        many0(pair(char('.'), identifier)),
        opt(alt((tag(".*"), recognize(many1(tag("[]")))))),
    )))(input)
}

/// A class pattern with an optional step variable. Direction and skip are
/// placeholders until the preceding arrow is known.
fn step(input: &str) -> IResult<&str, Step> {
    map(
        pair(class_name, opt(preceded(multispace1, identifier))),
        |(pattern, var)| {
            Step::new(
                pattern.to_owned(),
                var.unwrap_or_default().to_owned(),
                true,
                false,
            )
        },
    )(input)
}

/// (outbound, skip) for each arrow form. The doubled arrows must be tried
/// before their singles.
fn arrow(input: &str) -> IResult<&str, (bool, bool)> {
    alt((
        value((true, true), tag("->>")),
        value((false, true), tag("<<-")),
        value((true, false), tag("->")),
        value((false, false), tag("<-")),
    ))(input)
}

fn path(input: &str) -> IResult<&str, Vec<Step>> {
    map(
        pair(
            step,
            many0(pair(
                preceded(multispace0, arrow),
                preceded(multispace0, step),
            )),
        ),
        |(first, rest)| {
            let mut steps = vec![first];
            for ((outbound, skip), mut step) in rest {
                step.outbound = outbound;
                step.skip = skip;
                steps.push(step);
            }
            steps
        },
    )(input)
}

fn histo_command(input: &str) -> IResult<&str, RawCommand> {
    map(
        tuple((
            tag("histo"),
            multispace1,
            separated_list1(delimited(multispace0, char(','), multispace0), identifier),
            multispace1,
            tag("of"),
            multispace1,
            path,
        )),
        |(_, _, args, _, _, _, steps)| RawCommand::Histo {
            args: args.into_iter().map(str::to_owned).collect(),
            steps,
        },
    )(input)
}

fn set_command(input: &str) -> IResult<&str, Command> {
    preceded(
        pair(tag("set"), multispace1),
        alt((
            threshold,
            value(Command::SetNoThreshold, tag("nothreshold")),
            value(Command::SetGarbage(Visibility::Live), tag("nogarbage")),
            garbage,
            skip_command,
        )),
    )(input)
}

/// Decimal integer with an optional `k`/`m`/`g` suffix (powers of 1024).
fn size(input: &str) -> IResult<&str, u64> {
    map_res(pair(digit1, opt(one_of("kmg"))), |(digits, suffix)| {
        str::parse::<u64>(digits).map(|v| match suffix {
            Some('k') => v << 10,
            Some('m') => v << 20,
            Some('g') => v << 30,
            _ => v,
        })
    })(input)
}

fn threshold(input: &str) -> IResult<&str, Command> {
    map(
        tuple((
            tag("threshold"),
            multispace1,
            size,
            multispace1,
            alt((
                value(ThresholdDim::Objects, tag("objects")),
                value(ThresholdDim::Bytes, tag("bytes")),
                value(ThresholdDim::Retained, tag("retained")),
            )),
        )),
        |(_, _, value, _, dim)| Command::SetThreshold { value, dim },
    )(input)
}

fn garbage(input: &str) -> IResult<&str, Command> {
    map(
        preceded(tag("garbage"), opt(preceded(multispace1, tag("only")))),
        |only| {
            Command::SetGarbage(if only.is_some() {
                Visibility::NonLive
            } else {
                Visibility::All
            })
        },
    )(input)
}

fn skip_command(input: &str) -> IResult<&str, Command> {
    map(
        pair(
            alt((value(false, tag("noskip")), value(true, tag("skip")))),
            preceded(multispace1, class_name),
        ),
        |(skip, pattern)| Command::SetSkip {
            pattern: pattern.to_owned(),
            skip,
        },
    )(input)
}
