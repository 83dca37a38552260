//! Command grammar for `.job` files.
//!
//! One command per line, keywords case-sensitive. Anything the grammar
//! does not recognize parses to [`Command::Invalid`]; the runner logs
//! and skips it.

use std::io::{self, BufRead};

use crate::protocol::MAX_STRING_SIZE;

/// Upper bound on pairs/keys in a single WRITE, READ or DELETE.
pub const MAX_PAIRS_PER_COMMAND: usize = 256;

/// A parsed job-file command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `WRITE [(k,v)(k,v)...]` — upsert each pair.
    Write(Vec<(String, String)>),
    /// `READ [k,k,...]` — render each key's value.
    Read(Vec<String>),
    /// `DELETE [k,k,...]` — remove each key.
    Delete(Vec<String>),
    /// `SHOW` — render the whole table.
    Show,
    /// `WAIT <ms>` — sleep the worker.
    Wait(u64),
    /// `BACKUP` — snapshot the table.
    Backup,
    /// `HELP` — print usage.
    Help,
    /// Blank line or `#` commentary.
    Empty,
    /// Anything else.
    Invalid,
}

/// Reads and parses the next command, or `None` at end of file.
pub fn next_command(input: &mut impl BufRead) -> io::Result<Option<Command>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(parse_line(&line)))
}

/// Parses a single line of a job file.
pub fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Command::Empty;
    }

    if let Some(rest) = line.strip_prefix("WRITE") {
        parse_pair_list(rest).map_or(Command::Invalid, Command::Write)
    } else if let Some(rest) = line.strip_prefix("READ") {
        parse_key_list(rest).map_or(Command::Invalid, Command::Read)
    } else if let Some(rest) = line.strip_prefix("DELETE") {
        parse_key_list(rest).map_or(Command::Invalid, Command::Delete)
    } else if line == "SHOW" {
        Command::Show
    } else if let Some(rest) = line.strip_prefix("WAIT") {
        rest.trim()
            .parse::<u64>()
            .map_or(Command::Invalid, Command::Wait)
    } else if line == "BACKUP" {
        Command::Backup
    } else if line == "HELP" {
        Command::Help
    } else {
        Command::Invalid
    }
}

fn valid_token(token: &str) -> bool {
    !token.is_empty() && token.len() <= MAX_STRING_SIZE
}

/// Parses `[k,k,...]`; `None` on any malformation.
fn parse_key_list(rest: &str) -> Option<Vec<String>> {
    let inner = rest
        .trim()
        .strip_prefix('[')?
        .strip_suffix(']')?;
    let keys: Vec<String> = inner.split(',').map(|k| k.trim().to_owned()).collect();
    if keys.is_empty()
        || keys.len() > MAX_PAIRS_PER_COMMAND
        || !keys.iter().all(|k| valid_token(k))
    {
        return None;
    }
    Some(keys)
}

/// Parses `[(k,v)(k,v)...]`; `None` on any malformation.
fn parse_pair_list(rest: &str) -> Option<Vec<(String, String)>> {
    let mut inner = rest.trim().strip_prefix('[')?.strip_suffix(']')?.trim();
    let mut pairs = Vec::new();
    while !inner.is_empty() {
        let body = inner.strip_prefix('(')?;
        let (pair, tail) = body.split_once(')')?;
        let (key, value) = pair.split_once(',')?;
        let (key, value) = (key.trim(), value.trim());
        if !valid_token(key) || !valid_token(value) {
            return None;
        }
        pairs.push((key.to_owned(), value.to_owned()));
        // Pairs may be packed tight or separated by commas/spaces.
        inner = tail.trim_start().trim_start_matches(',').trim_start();
    }
    if pairs.is_empty() || pairs.len() > MAX_PAIRS_PER_COMMAND {
        return None;
    }
    Some(pairs)
}
