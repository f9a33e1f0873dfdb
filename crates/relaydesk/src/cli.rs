//! Command-line parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use relaydesk_core::FormatHint;

/// Bulk relay manager: import, validate and dispatch through SMTP and API relays.
#[derive(Parser, Debug)]
#[command(name = "relaydesk", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// What the user asked for.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Import relay credentials from a txt, csv or Excel file.
    Import {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,
        /// Single-character CSV delimiter; detected from the first line when omitted.
        #[arg(long, value_parser = parse_delimiter)]
        delimiter: Option<u8>,
        /// Validate every parsed relay before storing it.
        #[arg(long)]
        validate: bool,
    },
    /// Revalidate every stored relay.
    Validate,
    /// List stored relays without their secrets.
    List,
    /// Delete relays whose last validation failed.
    PurgeInvalid,
    /// Dispatch a campaign described by a JSON file.
    Send { campaign: PathBuf },
}

/// Import file format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatArg {
    Auto,
    Csv,
    Txt,
    Excel,
}

impl From<FormatArg> for FormatHint {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Auto => Self::Auto,
            FormatArg::Csv => Self::Csv,
            FormatArg::Txt => Self::Txt,
            FormatArg::Excel => Self::Excel,
        }
    }
}

fn parse_delimiter(value: &str) -> Result<u8, String> {
    let unescaped = if value == "\\t" || value.eq_ignore_ascii_case("tab") {
        "\t"
    } else {
        value
    };
    match unescaped.as_bytes() {
        [byte] if byte.is_ascii() => Ok(*byte),
        _ => Err(format!("delimiter must be a single ASCII character, got '{value}'")),
    }
}
