//! Recording and replaying of process traces.
//!
//! A traced process writes two append-only streams into the log directory:
//! the receive trace `<id>.trace` with every packet it popped from its
//! mailbox, and the send trace `<id>.snd` with the outcome of every send and
//! spawn. Both start with a header:
//!
//! | bytes | content                                    |
//! |-------|--------------------------------------------|
//! | 4     | magic `PNTR`                               |
//! | 4     | version marker                             |
//! | 1     | stream type, `0x01` receive or `0x02` send |
//! | ...   | frame with (process id, parent id)         |
//!
//! followed by frames prefixed with their `u32` big-endian length.
//!
//! Replaying feeds the receive trace into the process instead of a live
//! mailbox and answers sends and spawns from the send trace.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{Codec, CODEC_VERSION};
use crate::common::command::{Command, Packet};
use crate::common::pid::ProcessId;
use crate::common::queue::Mailbox;
use crate::error::{ProcessResult, TraceError};
use crate::transport::tcp::MAX_FRAME_SIZE;

/// Magic bytes of trace files.
pub const TRACE_MAGIC: &[u8; 4] = b"PNTR";

/// Version marker of trace files.
pub const TRACE_VERSION: [u8; 4] = [0, 1, 0, CODEC_VERSION];

/// Stream type of receive traces.
pub const RECEIVE_TRACE: u8 = 0x01;

/// Stream type of send traces.
pub const SEND_TRACE: u8 = 0x02;

/// Extension of receive traces.
pub const RECEIVE_EXT: &str = "trace";

/// Extension of send traces.
pub const SEND_EXT: &str = "snd";

////////////////////////////////////////////////////////////////////////////////

/// Recorded outcome of an outbound operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SendRecord {
    /// Result of a send.
    Message(bool),
    /// Children created by a spawn.
    New(Vec<ProcessId>),
}

impl SendRecord {
    /// Command of the recorded operation.
    pub fn command(&self) -> Command {
        match self {
            SendRecord::Message(_) => Command::Message,
            SendRecord::New(_) => Command::New,
        }
    }
}

/// Paths of receive and send traces of the process.
pub fn trace_paths(logdir: &Path, pid: &ProcessId) -> (PathBuf, PathBuf) {
    let base = logdir.join(pid.filename_form());
    (base.with_extension(RECEIVE_EXT), base.with_extension(SEND_EXT))
}

fn ended(path: &Path, e: io::Error) -> TraceError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TraceError::Ended(path.display().to_string())
    } else {
        TraceError::Io(e)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Appends records to one trace stream.
pub struct TraceWriter {
    out: BufWriter<File>,
    codec: Codec,
}

impl TraceWriter {
    /// Creates trace file and writes its header.
    pub fn create(
        path: &Path,
        stream: u8,
        pid: &ProcessId,
        parent: Option<&ProcessId>,
        codec: Codec,
    ) -> Result<Self, TraceError> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(TRACE_MAGIC)?;
        out.write_all(&TRACE_VERSION)?;
        out.write_all(&[stream])?;
        let mut writer = Self { out, codec };
        writer.append(&(pid, parent))?;
        Ok(writer)
    }

    /// Appends one record.
    pub fn append<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<(), TraceError> {
        let bytes = self
            .codec
            .encode(record)
            .map_err(|e| TraceError::Corrupted(e.to_string()))?;
        self.out.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.out.write_all(&bytes)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Reads records of one trace stream.
pub struct TraceReader {
    input: BufReader<File>,
    codec: Codec,
    path: PathBuf,
}

/// Header of a trace stream.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceHeader {
    /// Stream type.
    pub stream: u8,
    /// Traced process.
    pub pid: ProcessId,
    /// Parent of the traced process.
    pub parent: Option<ProcessId>,
}

impl TraceReader {
    /// Opens trace file and validates its header.
    /// If `expected` is set, the stream type must match it.
    pub fn open(
        path: &Path,
        expected: Option<u8>,
        codec: Codec,
    ) -> Result<(Self, TraceHeader), TraceError> {
        let mut input = BufReader::new(File::open(path)?);
        let mut prefix = [0u8; 9];
        input.read_exact(&mut prefix).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                TraceError::Format(format!("{} is too short", path.display()))
            } else {
                TraceError::Io(e)
            }
        })?;
        if &prefix[..4] != TRACE_MAGIC {
            return Err(TraceError::Format(format!(
                "{} is not a trace file",
                path.display()
            )));
        }
        if prefix[4..8] != TRACE_VERSION {
            return Err(TraceError::Version(format!(
                "{} has version {:?}, expected {:?}",
                path.display(),
                &prefix[4..8],
                TRACE_VERSION
            )));
        }
        let stream = prefix[8];
        if expected.is_some_and(|expected| expected != stream) {
            return Err(TraceError::Format(format!(
                "{} has stream type {:#04x}",
                path.display(),
                stream
            )));
        }

        let mut reader = Self {
            input,
            codec,
            path: path.to_owned(),
        };
        let (pid, parent): (ProcessId, Option<ProcessId>) = reader.next()?;
        Ok((reader, TraceHeader { stream, pid, parent }))
    }

    /// Reads the next record.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T, TraceError> {
        let mut len = [0u8; 4];
        self.input
            .read_exact(&mut len)
            .map_err(|e| ended(&self.path, e))?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TraceError::Corrupted(format!(
                "{}: record of {} bytes",
                self.path.display(),
                len
            )));
        }
        let mut bytes = vec![0u8; len];
        self.input
            .read_exact(&mut bytes)
            .map_err(|e| ended(&self.path, e))?;
        self.codec
            .decode(&bytes)
            .map_err(|e| TraceError::Corrupted(format!("{}: {}", self.path.display(), e)))
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Receive and send trace writers of one process.
pub struct Recorder {
    receive: Mutex<TraceWriter>,
    send: Mutex<TraceWriter>,
}

impl Recorder {
    /// Creates both trace files of the process in the log directory.
    pub fn create(
        logdir: &Path,
        pid: &ProcessId,
        parent: Option<&ProcessId>,
        codec: &Codec,
    ) -> Result<Self, TraceError> {
        std::fs::create_dir_all(logdir)?;
        let (receive, send) = trace_paths(logdir, pid);
        Ok(Self {
            receive: Mutex::new(TraceWriter::create(
                &receive,
                RECEIVE_TRACE,
                pid,
                parent,
                codec.clone(),
            )?),
            send: Mutex::new(TraceWriter::create(
                &send,
                SEND_TRACE,
                pid,
                parent,
                codec.clone(),
            )?),
        })
    }

    /// Appends popped packet to the receive trace.
    pub fn record_receive(&self, src: &ProcessId, packet: &Packet) -> Result<(), TraceError> {
        self.receive.lock().append(&(src, packet))
    }

    /// Appends outcome of an outbound operation to the send trace.
    pub fn record_send(&self, record: &SendRecord) -> Result<(), TraceError> {
        self.send.lock().append(record)
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Mailbox feeding a process from its recorded traces.
pub struct ReplayMailbox {
    receive: Mutex<TraceReader>,
    send: Mutex<TraceReader>,
    pid: ProcessId,
    parent: Option<ProcessId>,
    codec: Codec,
}

impl ReplayMailbox {
    /// Opens receive trace `path` and its sibling send trace.
    pub fn open(path: &Path, codec: &Codec) -> Result<Self, TraceError> {
        if path.extension().and_then(|e| e.to_str()) != Some(RECEIVE_EXT) {
            return Err(TraceError::Format(format!(
                "{} must have extension .{}",
                path.display(),
                RECEIVE_EXT
            )));
        }
        let send_path = path.with_extension(SEND_EXT);
        if !send_path.exists() {
            return Err(TraceError::Mismatch(format!(
                "missing send trace {}",
                send_path.display()
            )));
        }

        let (receive, receive_header) = TraceReader::open(path, Some(RECEIVE_TRACE), codec.clone())?;
        let (send, send_header) = TraceReader::open(&send_path, Some(SEND_TRACE), codec.clone())?;
        if receive_header.pid != send_header.pid || receive_header.parent != send_header.parent {
            return Err(TraceError::Corrupted(format!(
                "{} and {} belong to different processes",
                path.display(),
                send_path.display()
            )));
        }

        Ok(Self {
            receive: Mutex::new(receive),
            send: Mutex::new(send),
            pid: codec.substitute_pid(receive_header.pid),
            parent: receive_header.parent.map(|p| codec.substitute_pid(p)),
            codec: codec.clone(),
        })
    }

    /// Recorded process.
    pub fn pid(&self) -> &ProcessId {
        &self.pid
    }

    /// Parent of the recorded process.
    pub fn parent(&self) -> Option<&ProcessId> {
        self.parent.as_ref()
    }
}

impl Mailbox for ReplayMailbox {
    fn push(&self, src: ProcessId, packet: Packet) {
        log::trace!(
            "{}: ignoring live {:?} from {} while replaying",
            self.pid,
            packet.command,
            src
        );
    }

    fn pop(
        &self,
        _block: bool,
        _timeout: Option<Duration>,
    ) -> ProcessResult<Option<(ProcessId, Packet)>> {
        let (src, packet): (ProcessId, Packet) = self.receive.lock().next()?;
        Ok(Some((self.codec.substitute_pid(src), packet)))
    }

    fn len(&self) -> usize {
        1
    }

    fn close(&self) {}

    fn record_send(&self, _record: SendRecord) -> Result<(), TraceError> {
        Ok(())
    }

    fn replay_send(&self) -> Result<SendRecord, TraceError> {
        self.send.lock().next()
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Prints header and every record of a trace file.
pub fn dump<W: Write>(path: &Path, codec: &Codec, out: &mut W) -> Result<(), TraceError> {
    let (mut reader, header) = TraceReader::open(path, None, codec.clone())?;
    let kind = match header.stream {
        RECEIVE_TRACE => "receive",
        SEND_TRACE => "send",
        _ => "unknown",
    };
    writeln!(out, "{} trace of {:?}", kind, header.pid)?;
    writeln!(out, "parent: {:?}", header.parent)?;

    let mut index = 0;
    loop {
        let line = match header.stream {
            RECEIVE_TRACE => reader
                .next::<(ProcessId, Packet)>()
                .map(|(src, packet)| format!("{} -> {:?}", src, packet)),
            SEND_TRACE => reader.next::<SendRecord>().map(|r| format!("{:?}", r)),
            other => {
                return Err(TraceError::Format(format!(
                    "unknown stream type {:#04x}",
                    other
                )))
            }
        };
        match line {
            Ok(line) => writeln!(out, "{:>6}: {}", index, line)?,
            Err(TraceError::Ended(_)) => break,
            Err(e) => return Err(e),
        }
        index += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use super::{
        dump, trace_paths, Recorder, ReplayMailbox, SendRecord, TraceReader, RECEIVE_TRACE,
        SEND_TRACE,
    };
    use crate::codec::Codec;
    use crate::common::command::{Body, Command, Packet};
    use crate::common::pid::ProcessId;
    use crate::common::queue::{LiveMailbox, Mailbox};
    use crate::error::{ProcessError, TraceError};

    fn packets(src: &ProcessId) -> Vec<(ProcessId, Packet)> {
        (0..5)
            .map(|i| {
                (
                    src.clone(),
                    Packet::new(Command::Start, Body::Start { seqno: i }),
                )
            })
            .collect()
    }

    /// Records five popped packets and two sends, returns the receive trace path.
    fn record(dir: &std::path::Path, pid: &ProcessId, parent: &ProcessId) -> std::path::PathBuf {
        let codec = Codec::default();
        let recorder = Recorder::create(dir, pid, Some(parent), &codec).unwrap();
        let mailbox = LiveMailbox::recording(recorder);
        for (src, packet) in packets(parent) {
            mailbox.push(src, packet);
        }
        while mailbox.pop(false, None).unwrap().is_some() {}
        mailbox.record_send(SendRecord::Message(true)).unwrap();
        mailbox
            .record_send(SendRecord::New(vec![parent.clone()]))
            .unwrap();
        trace_paths(dir, pid).0
    }

    #[test]
    fn round_trip_reproduces_records() {
        let dir = tempfile::tempdir().unwrap();
        let pid = ProcessId::create("Worker", "h", vec![1], "w", "n");
        let parent = ProcessId::create("Main", "h", vec![1], "m", "n");
        let path = record(dir.path(), &pid, &parent);

        let replay = ReplayMailbox::open(&path, &Codec::default()).unwrap();
        assert_eq!(replay.pid(), &pid);
        assert_eq!(replay.parent(), Some(&parent));

        let replayed: Vec<(ProcessId, Packet)> = (0..5)
            .map(|_| replay.pop(true, None).unwrap().unwrap())
            .collect();
        assert_eq!(replayed, packets(&parent));
        assert!(matches!(
            replay.pop(true, None),
            Err(ProcessError::Trace(TraceError::Ended(_)))
        ));

        assert_eq!(replay.replay_send().unwrap(), SendRecord::Message(true));
        assert_eq!(
            replay.replay_send().unwrap().command(),
            Command::New
        );
        assert!(matches!(replay.replay_send(), Err(TraceError::Ended(_))));
    }

    #[test]
    fn truncated_record_ends_trace() {
        let dir = tempfile::tempdir().unwrap();
        let pid = ProcessId::create("Worker", "h", vec![1], "w", "n");
        let parent = ProcessId::create("Main", "h", vec![1], "m", "n");
        let path = record(dir.path(), &pid, &parent);

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let replay = ReplayMailbox::open(&path, &Codec::default()).unwrap();
        for _ in 0..4 {
            assert!(replay.pop(true, None).unwrap().is_some());
        }
        assert!(matches!(
            replay.pop(true, None),
            Err(ProcessError::Trace(TraceError::Ended(_)))
        ));
    }

    #[test]
    fn oversized_record_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let pid = ProcessId::create("Worker", "h", vec![1], "w", "n");
        let parent = ProcessId::create("Main", "h", vec![1], "m", "n");
        let path = record(dir.path(), &pid, &parent);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&u32::MAX.to_be_bytes()).unwrap();
        file.write_all(b"tail").unwrap();
        drop(file);

        let replay = ReplayMailbox::open(&path, &Codec::default()).unwrap();
        for _ in 0..5 {
            assert!(replay.pop(true, None).unwrap().is_some());
        }
        assert!(matches!(
            replay.pop(true, None),
            Err(ProcessError::Trace(TraceError::Corrupted(_)))
        ));
    }

    #[test]
    fn header_validation() {
        let dir = tempfile::tempdir().unwrap();
        let pid = ProcessId::create("Worker", "h", vec![1], "w", "n");
        let parent = ProcessId::create("Main", "h", vec![1], "m", "n");
        let path = record(dir.path(), &pid, &parent);
        let (_, send_path) = trace_paths(dir.path(), &pid);
        let codec = Codec::default();

        assert!(matches!(
            TraceReader::open(&path, Some(SEND_TRACE), codec.clone()),
            Err(TraceError::Format(_))
        ));
        assert!(TraceReader::open(&send_path, Some(SEND_TRACE), codec.clone()).is_ok());
        assert!(matches!(
            ReplayMailbox::open(&send_path, &codec),
            Err(TraceError::Format(_))
        ));

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[5] ^= 0xff;
        let bad_version = dir.path().join("bad_version.trace");
        std::fs::write(&bad_version, &bytes).unwrap();
        assert!(matches!(
            TraceReader::open(&bad_version, Some(RECEIVE_TRACE), codec.clone()),
            Err(TraceError::Version(_))
        ));

        let bad_magic = dir.path().join("bad_magic.trace");
        let mut file = std::fs::File::create(&bad_magic).unwrap();
        file.write_all(b"JUNKJUNKJUNK").unwrap();
        assert!(matches!(
            TraceReader::open(&bad_magic, None, codec.clone()),
            Err(TraceError::Format(_))
        ));

        // No sibling send trace.
        assert!(matches!(
            ReplayMailbox::open(&bad_version, &codec),
            Err(TraceError::Mismatch(_))
        ));
    }

    #[test]
    fn traces_of_different_processes_are_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProcessId::create("Worker", "h", vec![1], "a", "n");
        let second = ProcessId::create("Worker", "h", vec![1], "b", "n");
        let parent = ProcessId::create("Main", "h", vec![1], "m", "n");
        let first_path = record(dir.path(), &first, &parent);
        record(dir.path(), &second, &parent);

        std::fs::copy(
            trace_paths(dir.path(), &second).1,
            trace_paths(dir.path(), &first).1,
        )
        .unwrap();
        assert!(matches!(
            ReplayMailbox::open(&first_path, &Codec::default()),
            Err(TraceError::Corrupted(_))
        ));
    }

    #[test]
    fn dump_prints_records() {
        let dir = tempfile::tempdir().unwrap();
        let pid = ProcessId::create("Worker", "h", vec![1], "w", "n");
        let parent = ProcessId::create("Main", "h", vec![1], "m", "n");
        let path = record(dir.path(), &pid, &parent);

        let mut out = Vec::new();
        dump(&path, &Codec::default(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("receive trace of"));
        assert_eq!(text.lines().count(), 2 + 5);
    }
}
