// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber command lines.
//!
//! ```text
//! subscribe <topic> <0|1>
//! unsubscribe <topic>
//! ```
//!
//! Tokens are whitespace separated. The trailing flag of `subscribe` enables
//! store-and-forward for that subscription.

use thiserror::Error;

use crate::wire::TOPIC_LEN;

/// Characters stripped from both ends of a command line.
const TRIM: &[char] = &[' ', '\t', '\r', '\n'];

/// A parsed subscriber command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe { topic: String, store_forward: bool },
    Unsubscribe { topic: String },
}

/// Why a command line was ignored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownVerb(String),

    #[error("{0} requires a topic")]
    MissingArgument(&'static str),

    #[error("invalid store-and-forward flag {0:?}")]
    InvalidStoreForwardFlag(String),

    #[error("unexpected trailing input {0:?}")]
    TrailingTokens(String),

    #[error("topic of {0} bytes exceeds {max}", max = TOPIC_LEN)]
    TopicTooLong(usize),

    #[error("command is not valid UTF-8")]
    NotUtf8,
}

fn checked_topic(topic: Option<&str>, verb: &'static str) -> Result<String, CommandError> {
    let topic = topic.ok_or(CommandError::MissingArgument(verb))?;
    if topic.len() > TOPIC_LEN {
        return Err(CommandError::TopicTooLong(topic.len()));
    }
    Ok(topic.to_string())
}

impl Command {
    /// Parse one line (with or without its terminator).
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.trim_matches(TRIM).split_whitespace();
        let verb = tokens.next().ok_or(CommandError::Empty)?;

        let command = match verb {
            "subscribe" => {
                let topic = checked_topic(tokens.next(), "subscribe")?;
                let flag = tokens
                    .next()
                    .ok_or(CommandError::MissingArgument("subscribe"))?;
                let store_forward = match flag {
                    "0" => false,
                    "1" => true,
                    _ => return Err(CommandError::InvalidStoreForwardFlag(flag.to_string())),
                };
                Self::Subscribe {
                    topic,
                    store_forward,
                }
            }
            "unsubscribe" => Self::Unsubscribe {
                topic: checked_topic(tokens.next(), "unsubscribe")?,
            },
            other => return Err(CommandError::UnknownVerb(other.to_string())),
        };

        match tokens.next() {
            Some(extra) => Err(CommandError::TrailingTokens(extra.to_string())),
            None => Ok(command),
        }
    }

    /// Parse raw bytes as received from the network.
    pub fn parse_bytes(line: &[u8]) -> Result<Self, CommandError> {
        let line = std::str::from_utf8(line).map_err(|_| CommandError::NotUtf8)?;
        Self::parse(line)
    }
}
