// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Lists serial ports, optionally filtered by a match expression.
//!
//! Exit codes: 0 success, 1 no match, 2 multiple matches where the
//! expression was expected to pin one port, 3 expression parse error,
//! 4 I/O error.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use okserial::{CompiledMatcher, Error, Scanner};

const LOG_LEVEL_ENV: &str = "OK_LOGGING_LEVEL";

#[derive(Parser)]
#[command(name = "okserial", version, about = "List and select serial ports")]
struct Cli {
    /// Match expression selecting ports; every port when omitted.
    expression: Option<String>,

    /// Include the full attribute dump for each port.
    #[arg(short, long)]
    verbose: bool,

    /// Log verbosity (error, warn, info, debug, trace). Falls back to
    /// OK_LOGGING_LEVEL, then "warn".
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("okserial: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_logging(flag: Option<&str>) {
    let level = flag
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .unwrap_or_else(|| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> okserial::Result<ExitCode> {
    let scanner = Scanner::from_env()?;
    let matcher = CompiledMatcher::compile(cli.expression.as_deref().unwrap_or(""))?;
    let hits = matcher.filter(scanner.scan());

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for port in &hits {
        writeln!(out, "{}", port.summary())?;
        if cli.verbose {
            for (key, value) in port.iter() {
                writeln!(out, "    {key}: {value}")?;
            }
        }
    }

    Ok(match (cli.expression.as_deref(), hits.len()) {
        (_, 0) => ExitCode::from(1),
        // an explicit expression is expected to pin exactly one port
        (Some(_), n) if n > 1 => ExitCode::from(2),
        _ => ExitCode::SUCCESS,
    })
}

fn exit_code(err: &Error) -> u8 {
    match err {
        Error::Parse(_) => 3,
        Error::NoMatch(_) => 1,
        Error::AmbiguousMatch { .. } => 2,
        _ => 4,
    }
}
