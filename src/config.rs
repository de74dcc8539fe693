//! Configuration module.
//!
//! Command-line interface for the inspection front-end, defined with
//! `clap`. The core library has no CLI surface of its own.

use clap::Parser;
use std::path::PathBuf;

/// Inspector for NSO/NRO/KIP executable containers.
///
/// Parses a container, relocates it against a load base, and prints the
/// recovered section map, symbols and PLT call-site names.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input container file
    pub input: PathBuf,

    /// Load base (defaults to 0x7100000000, or 0x60000000 for 32-bit images)
    #[arg(long, value_parser = parse_address)]
    pub base: Option<u64>,

    /// Print the symbol table with resolved addresses
    #[arg(long)]
    pub symbols: bool,

    /// Print PLT call-site name associations
    #[arg(long)]
    pub plt: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}

/// Accepts both decimal and `0x`-prefixed hexadecimal addresses.
fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_in_both_radixes() {
        assert_eq!(parse_address("0x7100000000").unwrap(), 0x7100000000);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xZZ").is_err());
    }
}
