use std::time::Duration;

use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::sequence::{preceded, tuple};
use nom::Parser;
use nom_supreme::ParserExt;

use crate::common::parser::{NomResult, consume_all, p_u32};

// Allows specifying humantime format (2h, 3m, etc.)
crate::arg_wrapper!(ArgDuration, Duration, humantime::parse_duration);

/// Slurm time limit: `MM`, `MM:SS` or `HH:MM:SS`. A single value means minutes.
pub(crate) fn p_slurm_time(input: &str) -> NomResult<Duration> {
    map(
        tuple((
            p_u32,
            opt(preceded(char(':'), p_u32)),
            opt(preceded(char(':'), p_u32)),
        )),
        |parsed| match parsed {
            (minutes, None, _) => Duration::from_secs(minutes as u64 * 60),
            (minutes, Some(seconds), None) => {
                Duration::from_secs(minutes as u64 * 60 + seconds as u64)
            }
            (hours, Some(minutes), Some(seconds)) => Duration::from_secs(
                hours as u64 * 3600 + minutes as u64 * 60 + seconds as u64,
            ),
        },
    )
    .context("MM, MM:SS or HH:MM:SS value")
    .parse(input)
}

/// Parses time limits the way `sbatch --time` reads them.
/// Individual time values may be zero padded.
pub fn parse_slurm_time(input: &str) -> anyhow::Result<Duration> {
    consume_all(p_slurm_time, input)
}

/// Format a duration as a `HH:MM:SS` string, e.g. 01:05:02.
/// Hours are not wrapped into days.
pub fn format_hms_duration(duration: &Duration) -> String {
    let mut seconds = duration.as_secs();
    let hours = seconds / 3600;
    seconds %= 3600;
    let minutes = seconds / 60;
    seconds %= 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
