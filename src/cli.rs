use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow, bail};
use cext_utils::logger;
use clap::{Parser, Subcommand};
use colored::Colorize;
use num_bigint::BigInt;
use tracing::debug;

use crate::bridge::integer::PackFlags;
use crate::bridge::{Bridge, Context, Flow, Unwind};
use crate::config::BridgeConfig;
use crate::ffi;
use crate::runtime::ManagedHeap;
use crate::version::VERSION;

#[derive(Parser, Debug)]
#[command(name = "cextbridge", version = VERSION, about = "Native extension bridge tools")]
pub struct BridgeCli {
    #[command(subcommand)]
    command: Command,
}

impl BridgeCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Packs an integer into native words and prints the bytes.
    Pack {
        #[arg(value_parser = parse_integer, allow_hyphen_values = true)]
        value: BigInt,
        /// Number of words.
        #[arg(long)]
        words: usize,
        /// Bytes per word.
        #[arg(long)]
        size: usize,
        /// Unused high bits per word.
        #[arg(long, default_value_t = 0)]
        nails: usize,
        /// Comma-separated layout flags (msword, lsword, msbyte, lsbyte, native, 2comp, generic).
        #[arg(long, default_value = "lsword,lsbyte")]
        flags: String,
    },
    /// Prints the byte size and leading zero bits of an integer's magnitude.
    Absint {
        #[arg(value_parser = parse_integer, allow_hyphen_values = true)]
        value: BigInt,
    },
    /// Lists the registered native entry points.
    Symbols {
        #[arg(long)]
        json: bool,
    },
    /// Prints the effective configuration.
    Config,
}

/// Decimal, or hexadecimal with a `0x` prefix; either may be negative.
fn parse_integer(raw: &str) -> Result<BigInt, String> {
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let parsed = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => BigInt::parse_bytes(hex.as_bytes(), 16),
        None => BigInt::parse_bytes(digits.as_bytes(), 10),
    };
    let magnitude = parsed.ok_or_else(|| format!("`{raw}` is not an integer"))?;
    Ok(if negative { -magnitude } else { magnitude })
}

pub fn run() -> Result<()> {
    let config = BridgeConfig::from_env();
    logger::init_logging(&config.log_filter);
    ffi::bootstrap_symbols();
    let cli = BridgeCli::parse();
    match &cli.command {
        Command::Pack {
            value,
            words,
            size,
            nails,
            flags,
        } => handle_pack(config, value, *words, *size, *nails, flags),
        Command::Absint { value } => handle_absint(config, value),
        Command::Symbols { json } => handle_symbols(*json),
        Command::Config => handle_config(&config),
    }
}

/// Runs `f` inside a native frame of a fresh bridge, turning a raised
/// exception into an error.
fn in_bridge<T>(config: BridgeConfig, f: impl FnOnce(&Context<'_>) -> Flow<T>) -> Result<T> {
    let bridge = Bridge::new(
        Arc::new(ManagedHeap::new()),
        BridgeConfig {
            abort_on_fatal: false,
            ..config
        },
    );
    bridge.with_lock(|cx| match f(cx) {
        Ok(value) => Ok(Ok(value)),
        Err(Unwind::Raise(exception)) => {
            let class = cx.describe(cx.wrap(exception));
            Ok(Err(anyhow!("{class}")))
        }
        Err(other) => Err(other),
    })
    .map_err(|unwind| anyhow!("unexpected non-local exit: {unwind:?}"))?
}

fn handle_pack(
    config: BridgeConfig,
    value: &BigInt,
    words: usize,
    size: usize,
    nails: usize,
    flags: &str,
) -> Result<()> {
    let flags = PackFlags::parse_names(flags).context("invalid --flags")?;
    let byte_len = words
        .checked_mul(size)
        .filter(|len| *len <= i32::MAX as usize)
        .ok_or_else(|| anyhow!("too big numwords * wordsize: {words} * {size}"))?;
    let mut buffer = vec![0u8; byte_len];
    debug!(words, size, nails, flags = %flags, "packing integer");

    let sign = in_bridge(config, |cx| {
        let handle = cx.integer(value);
        cx.integer_pack(handle, &mut buffer, words, size, nails, flags)
    })?;

    let status = match sign.abs() {
        2 => "overflow".red().bold(),
        0 => "zero".normal(),
        _ => "fits".green().bold(),
    };
    println!("{} {sign} ({status})", "sign".bold());
    let hex: Vec<String> = buffer
        .chunks(size.max(1))
        .map(|word| word.iter().map(|b| format!("{b:02x}")).collect())
        .collect();
    println!("{} {}", "words".bold(), hex.join(" "));
    Ok(())
}

fn handle_absint(config: BridgeConfig, value: &BigInt) -> Result<()> {
    let (bytes, nlz) = in_bridge(config, |cx| cx.absint_size(cx.integer(value)))?;
    println!("{} {bytes}", "bytes".bold());
    println!("{} {nlz}", "nlz_bits".bold());
    Ok(())
}

fn handle_symbols(json: bool) -> Result<()> {
    let functions = ffi::bootstrap_symbols().all();
    if json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }
    if functions.is_empty() {
        bail!("no native entry points registered");
    }
    for function in functions {
        println!(
            "{:<32} {:<34} {}",
            function.name.green(),
            function.symbol.dimmed(),
            function.signature
        );
    }
    Ok(())
}

fn handle_config(config: &BridgeConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
