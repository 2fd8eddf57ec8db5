use winnow::{
    Result,
    combinator::{alt, delimited, preceded, repeat},
    prelude::*,
    token::{any, none_of, one_of, take_till, take_while},
};

/// Variables that are defined for every job by the runner itself.
pub const PREDEFINED_VARIABLES: &[&str] = &["CI", "CI_COMMIT_REF_NAME", "CI_JOB_NAME", "CI_JOB_STAGE"];

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn var_name<'a>(input: &mut &'a str) -> Result<&'a str> {
    (one_of(is_name_start), take_while(0.., is_name_char))
        .take()
        .parse_next(input)
}

fn braced<'a>(input: &mut &'a str) -> Result<&'a str> {
    delimited("${", var_name, "}").parse_next(input)
}

fn bare<'a>(input: &mut &'a str) -> Result<&'a str> {
    preceded('$', var_name).parse_next(input)
}

fn single_quoted(input: &mut &str) -> Result<()> {
    delimited('\'', take_till(0.., '\''), '\'')
        .void()
        .parse_next(input)
}

/// One step inside a double-quoted string, where `"` ends the string and a
/// backslash escapes the next character.
fn quoted_piece<'a>(input: &mut &'a str) -> Result<Option<&'a str>> {
    alt((
        ('\\', any).value(None),
        "$$".value(None),
        alt((braced, bare)).map(Some),
        none_of('"').value(None),
    ))
    .parse_next(input)
}

fn double_quoted<'a>(input: &mut &'a str) -> Result<Vec<&'a str>> {
    let pieces: Vec<Option<&'a str>> =
        delimited('"', repeat(0.., quoted_piece), '"').parse_next(input)?;
    Ok(pieces.into_iter().flatten().collect())
}

/// A single step through a command: a quoted string, a variable reference,
/// or something that isn't one. Nothing inside single quotes expands.
fn piece<'a>(input: &mut &'a str) -> Result<Vec<&'a str>> {
    alt((
        single_quoted.value(Vec::new()),
        double_quoted,
        "$$".value(Vec::new()),
        alt((braced, bare)).map(|name| vec![name]),
        ('\\', any).value(Vec::new()),
        any.value(Vec::new()),
    ))
    .parse_next(input)
}

/// Returns the names of the variables referenced in a shell command, in the
/// order they appear.
///
/// Both `$NAME` and `${NAME}` are recognized. `$$` is an escaped dollar sign,
/// and positional or special parameters such as `$1` or `$?` are not
/// variables. Single-quoted text and backslash-escaped dollars are literal.
pub fn variable_references(command: &str) -> Vec<&str> {
    let mut input = command;
    let pieces: Vec<Vec<&str>> = repeat(0.., piece)
        .parse_next(&mut input)
        .unwrap_or_default();
    pieces.into_iter().flatten().collect()
}
