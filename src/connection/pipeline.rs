//! Write buffering: pipelines and MULTI/EXEC blocks.
//!
//! Both builders collect commands locally and hand them to the connection
//! as one buffer, so their waiters are contiguous in the queue and no other
//! caller's command can land between them on the wire.

use crate::cmd;
use crate::connection::command::{Command, Response};
use crate::connection::redis::RedisConnection;
use crate::error::{MuxredisError, Result};
use crate::resp::types::RespValue;

/// Commands written back to back, answered in order.
#[derive(Debug)]
pub struct Pipeline<'a> {
    conn: &'a RedisConnection,
    commands: Vec<Command>,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(conn: &'a RedisConnection) -> Self {
        Self {
            conn,
            commands: Vec::new(),
        }
    }

    /// Add a command (builder style).
    pub fn cmd(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Write every command and wait for all replies.
    ///
    /// A command rejected before writing gets its error in its own slot;
    /// the others are still sent.
    pub async fn execute(self) -> Result<Vec<Result<Response>>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        let handles = self.conn.send_batch(self.commands, false)?;
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            });
        }
        Ok(results)
    }
}

/// Commands wrapped in MULTI/EXEC and written as one buffer.
#[derive(Debug)]
pub struct Transaction<'a> {
    conn: &'a RedisConnection,
    commands: Vec<Command>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(conn: &'a RedisConnection) -> Self {
        Self {
            conn,
            commands: Vec::new(),
        }
    }

    pub fn cmd(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run the block and return one result per queued command.
    ///
    /// Nothing is written if any command fails local validation. An aborted
    /// EXEC (`EXECABORT`) is returned as the error of the whole call; a
    /// changed WATCH key yields [`MuxredisError::WatchChanged`] per command.
    pub async fn execute(self) -> Result<Vec<Result<RespValue>>> {
        let mut batch = Vec::with_capacity(self.commands.len() + 2);
        batch.push(cmd!("MULTI"));
        batch.extend(self.commands);
        batch.push(cmd!("EXEC"));

        let mut handles = self.conn.send_batch(batch, true)?.into_iter();
        let exec = handles
            .next_back()
            .ok_or_else(|| MuxredisError::Protocol("empty transaction batch".into()))??;

        // MULTI and QUEUED replies; queue-time errors surface through EXEC
        for handle in handles {
            let _ = handle?.await;
        }

        match exec.await? {
            Response::Exec(items) => Ok(items),
            Response::Value(v) => Err(MuxredisError::Protocol(format!(
                "unexpected {} reply to EXEC",
                v.type_name()
            ))),
        }
    }
}
