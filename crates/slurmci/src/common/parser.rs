use nom::combinator::all_consuming;
use nom::{IResult, Parser};
use nom_supreme::ParserExt;
use nom_supreme::error::ErrorTree;

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ErrorTree<&'a str>>;

pub(crate) fn format_parse_error(error: nom::Err<ErrorTree<&str>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("Parse error\n{e}"),
        nom::Err::Incomplete(_) => anyhow::anyhow!("Parse error: incomplete input"),
    }
}

/// Runs `parser` and fails unless it consumes the whole `input`.
pub fn consume_all<'a, O, F>(parser: F, input: &'a str) -> anyhow::Result<O>
where
    F: FnMut(&'a str) -> NomResult<'a, O>,
{
    all_consuming(parser)(input)
        .map(|(_, output)| output)
        .map_err(format_parse_error)
}

pub fn p_u32(input: &str) -> NomResult<u32> {
    nom::character::complete::u32::<&str, ErrorTree<&str>>
        .context("integer")
        .parse(input)
}

pub fn p_u64(input: &str) -> NomResult<u64> {
    nom::character::complete::u64::<&str, ErrorTree<&str>>
        .context("integer")
        .parse(input)
}
