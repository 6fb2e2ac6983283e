//! Parsed requests and argument lookup

use std::io::{self, Read};

use lfs_core::ObjectId;

use crate::error::ArgumentError;
use crate::pktline::PacketDataReader;

/// One request read off the wire.
///
/// `args[0]` is the command line; the remaining argument lines are
/// `key=value` pairs.
#[derive(Debug)]
pub struct Request<'a, R> {
    pub args: Vec<String>,
    pub body: RequestBody<'a, R>,
}

/// What followed the argument block
#[derive(Debug)]
pub enum RequestBody<'a, R> {
    Empty,
    Lines(Vec<String>),
    Data(PacketDataReader<'a, R>),
}

impl<R: Read> Request<'_, R> {
    pub fn command(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// Value of `key=...` among the argument lines after the command. The
    /// last occurrence wins.
    pub fn argument(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .skip(1)
            .rev()
            .find_map(|arg| arg.strip_prefix(key)?.strip_prefix('='))
    }

    /// Object id given as the second word of the command line.
    pub fn object_id(&self) -> Result<ObjectId, ArgumentError> {
        let word = self
            .command()
            .split(' ')
            .nth(1)
            .filter(|w| !w.is_empty())
            .ok_or(ArgumentError::MissingObjectId)?;
        Ok(ObjectId::from_hex(word)?)
    }

    /// Required decimal `size=` argument.
    pub fn size(&self) -> Result<u64, ArgumentError> {
        let value = self.argument("size").ok_or(ArgumentError::Missing("size"))?;
        value.parse().map_err(|_| ArgumentError::InvalidValue {
            key: "size",
            value: value.to_string(),
        })
    }

    /// Optional decimal argument.
    pub fn optional_number(&self, key: &'static str) -> Result<Option<usize>, ArgumentError> {
        self.argument(key)
            .map(|value| {
                value.parse().map_err(|_| ArgumentError::InvalidValue {
                    key,
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    pub fn lines(&self) -> &[String] {
        match &self.body {
            RequestBody::Lines(lines) => lines,
            _ => &[],
        }
    }

    /// Consume any unread payload so the next request starts on a packet
    /// boundary.
    pub fn drain(&mut self) -> io::Result<()> {
        if let RequestBody::Data(data) = &mut self.body {
            if !data.is_finished() {
                data.drain()?;
            }
        }
        Ok(())
    }
}
