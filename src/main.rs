//! Entry point for the nxo inspector.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Map the input container into memory.
//! 3. Parse it, relocate against the chosen load base, and print the
//!    recovered section map (plus symbols and PLT names on request).
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;
use tracing_subscriber::EnvFilter;

use nxo::config::Config;
use nxo::layout::SegmentKind;
use nxo::NxoFile;

fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file = File::open(&config.input)
        .with_context(|| format!("failed to open {}", config.input.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };

    let mut nxo = NxoFile::parse(&mmap)
        .with_context(|| format!("failed to parse {}", config.input.display()))?;

    let base = config
        .base
        .unwrap_or(if nxo.is_32bit { 0x6000_0000 } else { 0x71_0000_0000 });
    let diagnostics = nxo.relocate(base);
    for diag in &diagnostics {
        tracing::warn!("{diag}");
    }

    println!(
        "{:?} image: {} bytes at base 0x{:X} ({}-bit)",
        nxo.format,
        nxo.image.len(),
        base,
        if nxo.is_32bit { 32 } else { 64 }
    );
    for lib in &nxo.needed {
        println!("needs {lib}");
    }
    println!("\n{:<18} {:<18} {:<6} name", "start", "end", "kind");
    for section in &nxo.sections {
        let kind = match section.kind {
            SegmentKind::Code => "CODE",
            SegmentKind::Const => "CONST",
            SegmentKind::Data => "DATA",
            SegmentKind::Bss => "BSS",
        };
        println!(
            "0x{:<16X} 0x{:<16X} {:<6} {}",
            base + section.start,
            base + section.end,
            kind,
            section.name
        );
    }

    if config.symbols {
        println!();
        for sym in &nxo.symbols {
            if sym.name.is_empty() {
                continue;
            }
            match sym.resolved {
                Some(addr) => println!("0x{:<16X} {}", addr, sym.name),
                None => println!("{:<18} {}", "<undefined>", sym.name),
            }
        }
    }

    if config.plt {
        println!();
        for (call_site, name) in nxo.plt_name_associations() {
            println!("0x{:<16X} -> {}", base + call_site, name);
        }
    }

    if !diagnostics.is_empty() {
        println!("\n{} relocation(s) left unresolved", diagnostics.len());
    }
    Ok(())
}
