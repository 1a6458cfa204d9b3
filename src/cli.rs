//! CLI utilities for the demo drivers.
//!
//! The utilities present in this module are shared by the `framelink_server` and
//! `framelink_client` binaries: the message kinds they agree on and the line prompt the
//! client reads commands from.
use std::io::{BufRead, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Message kinds understood by the demo server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum DemoKind {
    /// Body: the sender's timestamp in milliseconds (`u64`); echoed back as `Pong`.
    Ping = 1,
    Pong = 2,
    /// Body: a length-prefixed UTF-8 string. Relayed copies carry the origin id (`u32`)
    /// pushed at the tail.
    Text = 3,
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Round-trip probe `.ping`
    Ping,
    /// Free text relayed to the other clients
    Say(String),
}

/// Prompt user for a valid client command.
///
/// Returns an error for unrecognized dot-commands and for I/O failures on either stream.
/// End of input is treated as `.exit`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| format!("failed to write prompt: {e}"))?;
    writer
        .flush()
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if read == 0 {
        return Ok(Command::Exit);
    }

    match s.trim_end() {
        ".exit" => Ok(Command::Exit),
        ".ping" => Ok(Command::Ping),
        s if !s.starts_with('.') => Ok(Command::Say(s.to_string())),
        s => Err(format!("unrecognized command '{}'", s)),
    }
}
