//! Transfer session state machine
//!
//! A session announces its capabilities, then answers one request at a time
//! until the client sends `quit` or closes the stream. Per-command failures
//! are reported to the client as `status 400` (or `409` for lock conflicts)
//! and the session keeps going; framing and I/O failures end it.

use std::io::{self, Read, Write};

use lfs_core::{
    HASH_ALGORITHM, LockError, LockFilter, LockRecord, LockRegistry, ObjectId, ObjectStore,
    Operation, PutOutcome,
};
use tracing::{debug, info, warn};

use crate::error::{ArgumentError, SessionError};
use crate::pktline::{MAX_PACKET_DATA, PacketReader, PacketWriter};
use crate::request::{Request, RequestBody};

const CAPABILITIES: [&str; 2] = ["version=1", "locking"];

/// Longest lockable path whose `path <id> <path>` listing line still fits in
/// one packet.
const MAX_LOCK_PATH: usize = MAX_PACKET_DATA - "path ".len() - 64 - " \n".len();

/// Whether the session keeps reading after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Quit,
    Version,
    ListLocks,
    Batch,
    VerifyObject,
    GetObject,
    PutObject,
    Lock,
    Unlock,
    Unknown,
}

impl Command {
    /// Exact keywords are checked before prefixes, so every command line
    /// maps to exactly one handler.
    fn classify(line: &str) -> Self {
        match line {
            "quit" => Command::Quit,
            "version 1" => Command::Version,
            "list-lock" | "list-locks" => Command::ListLocks,
            "batch" => Command::Batch,
            _ if line.starts_with("verify-object") => Command::VerifyObject,
            _ if line.starts_with("get-object") => Command::GetObject,
            _ if line.starts_with("put-object") => Command::PutObject,
            _ if line.starts_with("lock") => Command::Lock,
            _ if line.starts_with("unlock") => Command::Unlock,
            _ => Command::Unknown,
        }
    }
}

fn status(code: u16) -> String {
    format!("status {code}")
}

fn lock_fields(id: &ObjectId, record: &LockRecord) -> [String; 4] {
    [
        format!("id={id}"),
        format!("path={}", record.path),
        format!("locked-at={}", record.locked_at),
        format!("ownername={}", record.owner),
    ]
}

/// Executes requests against the store and lock registry and writes replies.
#[derive(Debug)]
pub struct CommandHandler<W> {
    writer: PacketWriter<W>,
    store: ObjectStore,
    locks: LockRegistry,
    operation: Operation,
}

impl<W: Write> CommandHandler<W> {
    pub fn new(output: W, store: ObjectStore, locks: LockRegistry, operation: Operation) -> Self {
        Self {
            writer: PacketWriter::new(output),
            store,
            locks,
            operation,
        }
    }

    pub fn into_output(self) -> W {
        self.writer.into_inner()
    }

    /// Argument lines, then a delimiter and list lines when there are any,
    /// then a flush.
    fn send_message(&mut self, args: &[String], lines: &[String]) -> Result<(), SessionError> {
        for arg in args {
            self.writer.write_line(arg)?;
        }
        if !lines.is_empty() {
            self.writer.write_delimiter()?;
            for line in lines {
                self.writer.write_line(line)?;
            }
        }
        self.writer.write_flush()?;
        Ok(())
    }

    fn send_status(&mut self, code: u16) -> Result<(), SessionError> {
        self.send_message(&[status(code)], &[])
    }

    fn send_failure(&mut self, err: &SessionError) -> Result<(), SessionError> {
        match err {
            SessionError::Lock(LockError::AlreadyLocked { id, path, existing }) => {
                let mut args = vec![status(409)];
                match existing {
                    Some(record) => args.extend(lock_fields(id, record)),
                    None => args.extend([format!("id={id}"), format!("path={path}")]),
                }
                self.send_message(&args, &[err.to_string()])
            }
            _ => self.send_message(&[status(400)], &[err.to_string()]),
        }
    }

    /// Announce protocol version and capabilities.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let args: Vec<String> = CAPABILITIES.iter().map(|c| c.to_string()).collect();
        self.send_message(&args, &[])
    }

    /// Answer one request.
    pub fn handle<R: Read>(&mut self, request: &mut Request<'_, R>) -> Result<Flow, SessionError> {
        if request.args.is_empty() {
            return Ok(Flow::Continue);
        }

        if let Some(algo) = request.args.get(2).and_then(|a| a.strip_prefix("hash-algo=")) {
            if algo != HASH_ALGORITHM {
                warn!("Rejecting {:?}: unsupported hash algorithm {}", request.command(), algo);
                request.drain()?;
                self.send_message(&[status(400)], &["unsupported hash algorithm".to_string()])?;
                return Ok(Flow::Continue);
            }
        }

        let command = Command::classify(request.command());
        debug!("Handling {:?}: {}", command, request.command());

        let result = match command {
            Command::Quit => {
                self.send_status(200)?;
                return Ok(Flow::Quit);
            }
            Command::Version => self.send_status(200),
            Command::ListLocks => self.list_locks(request),
            Command::Batch => self.batch(request),
            Command::VerifyObject => self.verify_object(request),
            Command::GetObject => self.get_object(request),
            Command::PutObject => self.put_object(request),
            Command::Lock => self.lock(request),
            Command::Unlock => self.unlock(request),
            Command::Unknown => {
                warn!("Ignoring unknown command {:?}", request.command());
                request.drain()?;
                return Ok(Flow::Continue);
            }
        };

        match result {
            Ok(()) => Ok(Flow::Continue),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!("{} failed: {}", request.command(), err);
                self.send_failure(&err)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn batch<R: Read>(&mut self, request: &Request<'_, R>) -> Result<(), SessionError> {
        let mut replies = Vec::with_capacity(request.lines().len());
        for line in request.lines() {
            let mut words = line.split(' ');
            let (Some(oid), Some(size)) = (words.next(), words.next()) else {
                return Err(ArgumentError::MalformedBatchLine(line.clone()).into());
            };
            let id = ObjectId::from_hex(oid)
                .map_err(|_| ArgumentError::MalformedBatchLine(line.clone()))?;
            let size: u64 = size
                .parse()
                .map_err(|_| ArgumentError::MalformedBatchLine(line.clone()))?;

            let action = match self.operation {
                Operation::Upload => "upload",
                Operation::Download if self.store.exists(&id, size) => "download",
                Operation::Download => "noop",
            };
            replies.push(format!("{oid} {size} {action}"));
        }
        debug!("Batch of {} objects for {}", replies.len(), self.operation);
        self.send_message(
            &[status(200), format!("hash-algo={HASH_ALGORITHM}")],
            &replies,
        )
    }

    fn verify_object<R: Read>(&mut self, request: &Request<'_, R>) -> Result<(), SessionError> {
        let id = request.object_id()?;
        let size = request.size()?;
        self.store.verify(&id, size)?;
        self.send_status(200)
    }

    fn get_object<R: Read>(&mut self, request: &Request<'_, R>) -> Result<(), SessionError> {
        let id = request.object_id()?;
        let content = self.store.get(&id)?;

        self.writer.write_line(&status(200))?;
        self.writer.write_line(&format!("size={}", content.size))?;
        self.writer.write_delimiter()?;
        // Once the header is out a read failure cannot be reported in-band
        for chunk in content.chunks {
            let chunk = chunk.map_err(lfs_core::StorageError::Io)?;
            self.writer.write_bytes(&chunk)?;
        }
        self.writer.write_flush()?;
        debug!("Sent object {} ({} bytes)", id, content.size);
        Ok(())
    }

    fn store_upload<R: Read>(&self, request: &mut Request<'_, R>) -> Result<PutOutcome, SessionError> {
        let id = request.object_id()?;
        let size = request.size()?;
        let mut empty = io::empty();
        let source: &mut dyn Read = match &mut request.body {
            RequestBody::Data(data) => data,
            _ => &mut empty,
        };
        Ok(self.store.put(&id, size, source)?)
    }

    fn put_object<R: Read>(&mut self, request: &mut Request<'_, R>) -> Result<(), SessionError> {
        let result = self.store_upload(request);
        // The payload is consumed whatever the outcome, so the next request
        // starts on a packet boundary
        request.drain()?;
        if let PutOutcome::AlreadyPresent = result? {
            debug!("Upload skipped, {} already stored", request.command());
        }
        self.send_status(200)
    }

    fn lock<R: Read>(&mut self, request: &Request<'_, R>) -> Result<(), SessionError> {
        let path = request.argument("path").ok_or(ArgumentError::Missing("path"))?;
        if path.len() > MAX_LOCK_PATH {
            return Err(ArgumentError::PathTooLong {
                len: path.len(),
                max: MAX_LOCK_PATH,
            }
            .into());
        }
        let record = self.locks.acquire(path)?;
        let mut args = vec![status(201)];
        args.extend(lock_fields(&record.id(), &record));
        self.send_message(&args, &[])
    }

    fn unlock<R: Read>(&mut self, request: &Request<'_, R>) -> Result<(), SessionError> {
        let id = request.object_id()?;
        let record = self.locks.release(&id)?;
        let mut args = vec![status(200)];
        args.extend(lock_fields(&id, &record));
        self.send_message(&args, &[])
    }

    fn list_locks<R: Read>(&mut self, request: &Request<'_, R>) -> Result<(), SessionError> {
        let filter = LockFilter {
            path: request.argument("path").map(str::to_string),
            id: request
                .argument("id")
                .map(ObjectId::from_hex)
                .transpose()
                .map_err(ArgumentError::from)?,
            limit: request.optional_number("limit")?,
        };
        let entries = self.locks.list(&filter)?;

        let mut lines = Vec::with_capacity(entries.len() * 5);
        for entry in &entries {
            let id = entry.id;
            lines.push(format!("lock {id}"));
            lines.push(format!("path {id} {}", entry.record.path));
            lines.push(format!("locked-at {id} {}", entry.record.locked_at));
            lines.push(format!("ownername {id} {}", entry.record.owner));
            lines.push(format!("owner {id} {}", entry.ownership.as_str()));
        }
        debug!("Listing {} locks", entries.len());
        self.send_message(&[status(202)], &lines)
    }
}

/// Drives a `CommandHandler` from a pkt-line input stream.
///
/// Reader and handler are separate fields so a request can keep borrowing
/// the reader (for upload payloads) while the handler writes its reply.
#[derive(Debug)]
pub struct SessionEngine<R, W> {
    reader: PacketReader<R>,
    handler: CommandHandler<W>,
}

impl<R: Read, W: Write> SessionEngine<R, W> {
    pub fn new(input: R, handler: CommandHandler<W>) -> Self {
        Self {
            reader: PacketReader::new(input),
            handler,
        }
    }

    pub fn start(&mut self) -> Result<(), SessionError> {
        self.handler.start()
    }

    /// Serve requests until `quit` or end of input.
    pub fn serve(&mut self) -> Result<(), SessionError> {
        loop {
            let Some(mut request) = self.reader.read_request()? else {
                debug!("Client closed the stream");
                return Ok(());
            };
            if self.handler.handle(&mut request)? == Flow::Quit {
                info!("Session ended by client");
                return Ok(());
            }
        }
    }

    /// Announce capabilities, then serve.
    pub fn run(&mut self) -> Result<(), SessionError> {
        self.start()?;
        self.serve()
    }

    pub fn into_output(self) -> W {
        self.handler.into_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exact_before_prefix() {
        assert_eq!(Command::classify("quit"), Command::Quit);
        assert_eq!(Command::classify("version 1"), Command::Version);
        assert_eq!(Command::classify("version 2"), Command::Unknown);
        assert_eq!(Command::classify("list-lock"), Command::ListLocks);
        assert_eq!(Command::classify("list-locks"), Command::ListLocks);
        assert_eq!(Command::classify("batch"), Command::Batch);
        assert_eq!(Command::classify("batch now"), Command::Unknown);
        assert_eq!(Command::classify("verify-object abc"), Command::VerifyObject);
        assert_eq!(Command::classify("get-object abc"), Command::GetObject);
        assert_eq!(Command::classify("put-object abc"), Command::PutObject);
        assert_eq!(Command::classify("lock"), Command::Lock);
        assert_eq!(Command::classify("unlock abc"), Command::Unlock);
        assert_eq!(Command::classify("quit now"), Command::Unknown);
        assert_eq!(Command::classify(""), Command::Unknown);
    }

    #[test]
    fn test_lock_fields() {
        let record = LockRecord {
            path: "test.zip".into(),
            locked_at: "2024-01-01T00:00:00Z".into(),
            owner: "jan".into(),
        };
        let fields = lock_fields(&record.id(), &record);
        assert_eq!(
            fields[0],
            "id=c7b8de23fd238fe5e16f6f03b844022f9f72fd168a0704d82d58f19cf72b7aa3"
        );
        assert_eq!(fields[1], "path=test.zip");
        assert_eq!(fields[2], "locked-at=2024-01-01T00:00:00Z");
        assert_eq!(fields[3], "ownername=jan");
    }
}
