//! klogfmt - pretty-prints the kernel log stream
//!
//! Reads raw `<N>message` lines and prints them timestamped and colored by
//! severity.
//!
//! # Usage
//!
//! ```text
//! nc target 3232 | klogfmt           # format a piped stream
//! klogfmt --connect target:3232      # connect to klogsrv directly
//! klogfmt --level warning < dmesg.txt
//! ```

use std::io;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crossterm::tty::IsTty;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use klog_fmt::{format_stream, Level, LineFormatter};

// ============================================================================
// CLI Arguments
// ============================================================================

/// klogfmt - kernel log console formatter
#[derive(Parser, Debug)]
#[command(name = "klogfmt", version, about)]
struct Args {
    /// Read from a running klogsrv (host:port) instead of stdin
    #[arg(short, long, value_name = "HOST:PORT")]
    connect: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Hide lines below this level
    #[arg(short, long, value_enum, default_value_t = LevelArg::Debug)]
    level: LevelArg,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LevelArg {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LevelArg> for Level {
    fn from(arg: LevelArg) -> Self {
        match arg {
            LevelArg::Debug => Level::Debug,
            LevelArg::Info => Level::Info,
            LevelArg::Warning => Level::Warning,
            LevelArg::Error => Level::Error,
            LevelArg::Critical => Level::Critical,
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let color = !args.no_color && io::stdout().is_tty();
    let formatter = LineFormatter::new(color).with_min_level(args.level.into());
    let mut stdout = tokio::io::stdout();

    match args.connect {
        Some(addr) => {
            let stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("Failed to connect to {addr}"))?;
            let mut reader = BufReader::new(stream);
            format_stream(&mut reader, &mut stdout, &formatter).await?;
        }
        None => {
            let mut reader = BufReader::new(tokio::io::stdin());
            format_stream(&mut reader, &mut stdout, &formatter).await?;
        }
    }

    Ok(())
}
