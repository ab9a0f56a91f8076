//! Reference guest interpreter speaking the evalhost stdio protocol.
//!
//! Emits the ready byte once booted, then reads evaluation units delimited
//! by the end-of-message sentinel and answers each with `<output><EOM>` on
//! stdout. Keeps a mutable variable store across units so session
//! stickiness is observable. Used by the integration tests as a stand-in
//! for a real interpreter.
//!
//! Unit language, one statement per line:
//!   NAME = EXPR      assign (EXPR: integers, variables, `+` chains)
//!   p EXPR           print the value of EXPR
//!   cwd              print the current working directory
//!   env NAME         print the value of an environment variable
//!   warn TEXT        write TEXT to stderr
//!   sleep MS         block for MS milliseconds
//!   quit             exit 0 without replying
//!   die CODE         exit CODE without replying
//!
//! Flags: `--no-ready` suppresses the ready marker (boot-hang simulation),
//! `--sentinel-eot` switches the end-of-message byte from 0x03 to 0x04.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

const READY: u8 = 0x06;
const END_OF_MESSAGE: u8 = 0x03;
const END_OF_TRANSMISSION: u8 = 0x04;

enum Reply {
    Output(String),
    Exit(i32),
}

fn main() {
    let mut emit_ready = true;
    let mut eom = END_OF_MESSAGE;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--no-ready" => emit_ready = false,
            "--sentinel-eot" => eom = END_OF_TRANSMISSION,
            other => {
                eprintln!("evalhost-stub: unknown flag: {other}");
                std::process::exit(2);
            }
        }
    }
    if let Err(error) = run(emit_ready, eom) {
        eprintln!("evalhost-stub: io error: {error}");
        std::process::exit(1);
    }
}

fn run(emit_ready: bool, eom: u8) -> io::Result<()> {
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    if emit_ready {
        stdout.write_all(&[READY])?;
        stdout.flush()?;
    }

    let mut vars: BTreeMap<String, i64> = BTreeMap::new();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stdin.read(&mut chunk)?;
        if n == 0 {
            // Host closed stdin; session over.
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        while let Some(end) = buf.iter().position(|byte| *byte == eom) {
            let unit: Vec<u8> = buf.drain(..=end).collect();
            let unit = String::from_utf8_lossy(&unit[..unit.len() - 1]).to_string();
            match execute(&mut vars, &unit) {
                Reply::Output(text) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.write_all(&[eom])?;
                    stdout.flush()?;
                }
                Reply::Exit(code) => std::process::exit(code),
            }
        }
    }
}

fn execute(vars: &mut BTreeMap<String, i64>, unit: &str) -> Reply {
    let mut printed: Vec<String> = Vec::new();
    for line in unit.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(expr) = line.strip_prefix("p ") {
            match eval_expr(vars, expr) {
                Ok(value) => printed.push(value.to_string()),
                Err(message) => warn(&message),
            }
        } else if line == "cwd" {
            match std::env::current_dir() {
                Ok(dir) => printed.push(dir.display().to_string()),
                Err(error) => warn(&format!("cwd unavailable: {error}")),
            }
        } else if let Some(name) = line.strip_prefix("env ") {
            match std::env::var(name.trim()) {
                Ok(value) => printed.push(value),
                Err(_) => warn(&format!("unset variable: {name}")),
            }
        } else if let Some(text) = line.strip_prefix("warn ") {
            warn(text);
        } else if let Some(ms) = line.strip_prefix("sleep ") {
            match ms.trim().parse::<u64>() {
                Ok(ms) => thread::sleep(Duration::from_millis(ms)),
                Err(_) => warn(&format!("bad sleep duration: {ms}")),
            }
        } else if line == "quit" {
            return Reply::Exit(0);
        } else if let Some(code) = line.strip_prefix("die ") {
            return Reply::Exit(code.trim().parse().unwrap_or(1));
        } else if let Some((name, expr)) = line.split_once('=') {
            match eval_expr(vars, expr) {
                Ok(value) => {
                    vars.insert(name.trim().to_string(), value);
                }
                Err(message) => warn(&message),
            }
        } else {
            warn(&format!("unrecognized input: {line}"));
        }
    }
    Reply::Output(printed.join("\n"))
}

fn eval_expr(vars: &BTreeMap<String, i64>, expr: &str) -> Result<i64, String> {
    let mut sum = 0i64;
    for term in expr.split('+') {
        let term = term.trim();
        let value = match term.parse::<i64>() {
            Ok(literal) => literal,
            Err(_) => *vars
                .get(term)
                .ok_or_else(|| format!("unknown variable: {term}"))?,
        };
        sum += value;
    }
    Ok(sum)
}

fn warn(message: &str) {
    eprintln!("{message}");
    let _ = io::stderr().flush();
}
