//! Actions the command line tool can run over a record stream.
//!
//! Records go to the supplied writer one per line; errors from the source
//! end the action and are returned to the caller.

use crate::aggregate::{aggregate_stream, DEFAULT_KEY_FIELDS};
use crate::error::{ReaderError, Result as ReaderResult};
use crate::record::{FlowField, FlowRecord, UnknownField};
use futures::{Stream, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::io::{self, Write};
use thiserror::Error;

/// Action names accepted on the command line
pub const KNOWN_ACTIONS: [&str; 4] = ["print", "ipset", "findip", "aggregate"];

/// Errors that can occur while running an action
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    Unknown(String),

    #[error("Invalid arguments for action '{action}': {message}")]
    InvalidArguments { action: String, message: String },

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("Failed to write output: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<UnknownField> for ActionError {
    fn from(e: UnknownField) -> Self {
        ActionError::InvalidArguments {
            action: "aggregate".to_string(),
            message: e.to_string(),
        }
    }
}

/// A parsed action plus its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print records in line format, stopping after `stop_after` records
    /// when given
    Print { stop_after: Option<usize> },
    /// Print each distinct address seen in records that carry data
    Ipset,
    /// Print records whose source or destination is one of the addresses
    Findip(HashSet<String>),
    /// Print one JSON summary per group of records sharing the key fields
    Aggregate(Vec<FlowField>),
}

impl Command {
    /// Parse an action name followed by its arguments
    pub fn parse(action: &str, args: &[String]) -> Result<Self, ActionError> {
        match action {
            "print" => match args {
                [] => Ok(Command::Print { stop_after: None }),
                [count] => {
                    let count: usize = count.parse().map_err(|_| ActionError::InvalidArguments {
                        action: action.to_string(),
                        message: format!("expected a record count, got {:?}", count),
                    })?;
                    // A count of zero means no limit
                    Ok(Command::Print {
                        stop_after: (count > 0).then_some(count),
                    })
                }
                _ => Err(ActionError::InvalidArguments {
                    action: action.to_string(),
                    message: "0 or 1 arguments expected".to_string(),
                }),
            },
            "ipset" => Ok(Command::Ipset),
            "findip" => Ok(Command::Findip(args.iter().cloned().collect())),
            "aggregate" => {
                if args.is_empty() {
                    return Ok(Command::Aggregate(DEFAULT_KEY_FIELDS.to_vec()));
                }
                let fields = args
                    .iter()
                    .map(|name| name.parse::<FlowField>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Command::Aggregate(fields))
            }
            other => Err(ActionError::Unknown(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Print { .. } => "print",
            Command::Ipset => "ipset",
            Command::Findip(_) => "findip",
            Command::Aggregate(_) => "aggregate",
        }
    }

    /// Run the action over `records`, writing its output to `out`
    pub async fn run<S, W>(&self, records: S, out: &mut W) -> Result<(), ActionError>
    where
        S: Stream<Item = ReaderResult<FlowRecord>> + Unpin,
        W: Write,
    {
        match self {
            Command::Print { stop_after } => print(records, *stop_after, out).await,
            Command::Ipset => ipset(records, out).await,
            Command::Findip(targets) => findip(records, targets, out).await,
            Command::Aggregate(fields) => aggregate(records, fields, out).await,
        }
    }
}

async fn print<S, W>(records: S, stop_after: Option<usize>, out: &mut W) -> Result<(), ActionError>
where
    S: Stream<Item = ReaderResult<FlowRecord>> + Unpin,
    W: Write,
{
    let mut records = records.take(stop_after.unwrap_or(usize::MAX));
    while let Some(record) = records.try_next().await? {
        writeln!(out, "{}", record.to_message())?;
    }
    Ok(())
}

async fn ipset<S, W>(mut records: S, out: &mut W) -> Result<(), ActionError>
where
    S: Stream<Item = ReaderResult<FlowRecord>> + Unpin,
    W: Write,
{
    let mut addresses = BTreeSet::new();
    while let Some(record) = records.try_next().await? {
        if record.log_status.is_sentinel() {
            continue;
        }
        addresses.extend(record.srcaddr);
        addresses.extend(record.dstaddr);
    }

    for address in addresses {
        writeln!(out, "{}", address)?;
    }
    Ok(())
}

async fn findip<S, W>(mut records: S, targets: &HashSet<String>, out: &mut W) -> Result<(), ActionError>
where
    S: Stream<Item = ReaderResult<FlowRecord>> + Unpin,
    W: Write,
{
    let matches = |address: &Option<String>| address.as_ref().is_some_and(|a| targets.contains(a));

    while let Some(record) = records.try_next().await? {
        if matches(&record.srcaddr) || matches(&record.dstaddr) {
            writeln!(out, "{}", record.to_message())?;
        }
    }
    Ok(())
}

async fn aggregate<S, W>(records: S, fields: &[FlowField], out: &mut W) -> Result<(), ActionError>
where
    S: Stream<Item = ReaderResult<FlowRecord>> + Unpin,
    W: Write,
{
    for summary in aggregate_stream(records, fields).await? {
        writeln!(out, "{}", serde_json::to_string(&summary)?)?;
    }
    Ok(())
}
