//! Line-oriented pipeline descriptions
//!
//! ```text
//! # comment
//! stage read-file reader
//! set reader.filename data.in
//! connect reader.data_out writer.data_in
//! set_bufcount default 8
//! set_bufsize reader.buf_in 4096
//! loop 4 stage sort sort$
//! ```
//!
//! `loop <n> <command>` runs `command` `n` times with every `$` replaced by
//! the 0-based iteration number. Any line that fails aborts the load.

use crate::error::{Error, Result};
use crate::network::Network;
use crate::registry::Registry;
use std::path::Path;

/// Default buffer count of a network built from a description
pub const DEFAULT_BUFCOUNT: usize = 4;

/// Default buffer size of a network built from a description
pub const DEFAULT_BUFSIZE: usize = 256;

/// Build a network from description text
pub fn load_str(registry: &Registry, name: &str, text: &str) -> Result<Network> {
    let mut network = Network::new(name, DEFAULT_BUFCOUNT, DEFAULT_BUFSIZE);
    apply(&mut network, registry, text)?;
    Ok(network)
}

/// Build a network from a description file
pub fn load_file(registry: &Registry, name: &str, path: impl AsRef<Path>) -> Result<Network> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
    tracing::debug!(path = %path.display(), "loading network description");
    load_str(registry, name, &text)
}

/// Apply description text to an existing network
pub fn apply(network: &mut Network, registry: &Registry, text: &str) -> Result<()> {
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        command(network, registry, line).map_err(|e| {
            tracing::error!(line = index + 1, error = %e, "bad network description line");
            Error::at_line(index + 1, e)
        })?;
    }
    Ok(())
}

fn command(network: &mut Network, registry: &Registry, line: &str) -> Result<()> {
    let (cmd, rest) = split_word(line);
    match cmd {
        "stage" => {
            let (kind, name) = two_args(cmd, rest)?;
            network.add_stage(registry, kind, name)?;
        }
        "set" => {
            let (path, value) = split_word(rest);
            if path.is_empty() || value.is_empty() {
                return Err(usage(cmd, "<stage>.<param> <value>"));
            }
            network.set_param(path, value)?;
        }
        "connect" => {
            let (from, to) = two_args(cmd, rest)?;
            let (from_stage, from_pin) = pin_path(from)?;
            let (to_stage, to_pin) = pin_path(to)?;
            network.connect(from_stage, from_pin, to_stage, to_pin)?;
        }
        "set_bufcount" => {
            let (target, n) = two_args(cmd, rest)?;
            let n = count(n)?;
            match target {
                "default" => network.set_default_bufcount(n)?,
                _ => {
                    let (stage, pin) = pin_path(target)?;
                    network.set_pin_bufcount(stage, pin, n)?;
                }
            }
        }
        "set_bufsize" => {
            let (target, n) = two_args(cmd, rest)?;
            let n = count(n)?;
            match target {
                "default" => network.set_default_bufsize(n)?,
                _ => {
                    let (stage, pin) = pin_path(target)?;
                    network.set_pin_bufsize(stage, pin, n)?;
                }
            }
        }
        "loop" => {
            let (n, body) = split_word(rest);
            let n = count(n)?;
            if n == 0 || body.is_empty() {
                return Err(Error::InvalidConfig(format!("invalid loop size {}", n)));
            }
            for i in 0..n {
                command(network, registry, &body.replace('$', &i.to_string()))?;
            }
        }
        _ => return Err(Error::InvalidConfig(format!("unknown command {:?}", cmd))),
    }
    Ok(())
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

fn two_args<'a>(cmd: &str, rest: &'a str) -> Result<(&'a str, &'a str)> {
    let (a, b) = split_word(rest);
    if a.is_empty() || b.is_empty() || b.contains(char::is_whitespace) {
        return Err(usage(cmd, "<arg> <arg>"));
    }
    Ok((a, b))
}

fn pin_path(path: &str) -> Result<(&str, &str)> {
    path.rsplit_once('.')
        .filter(|(stage, pin)| !stage.is_empty() && !pin.is_empty())
        .ok_or_else(|| Error::InvalidConfig(format!("expected <stage>.<pin>, got {:?}", path)))
}

fn count(s: &str) -> Result<usize> {
    s.parse()
        .map_err(|_| Error::InvalidConfig(format!("expected a non-negative number, got {:?}", s)))
}

fn usage(cmd: &str, args: &str) -> Error {
    Error::InvalidConfig(format!("usage: {} {}", cmd, args))
}
