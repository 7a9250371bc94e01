//! Container runtime exec capability: attach, resize, inspect-and-kill, and
//! the record splitter for file-transfer output.

use std::collections::HashMap;
use std::pin::Pin;

use bollard::container::ListContainersOptions;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::AsyncWrite;

use crate::error::{Error, Result};
use crate::proto::WinSize;

pub type ExecOutput =
    Pin<Box<dyn Stream<Item = std::result::Result<bollard::container::LogOutput, bollard::errors::Error>> + Send>>;
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Control handle for a created exec; the stream halves live in `ExecIo`.
#[derive(Clone)]
pub struct ExecHandle {
    docker: Docker,
    pub id: String,
}

pub struct ExecIo {
    pub output: ExecOutput,
    pub input: ExecInput,
}

/// Resolve a pod-scoped container name to a concrete container id using the
/// runtime's `name` filter (`<name>_<pod>`).
pub async fn resolve_container(docker: &Docker, name: &str, pod: &str) -> Result<Option<String>> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![format!("{name}_{pod}")]);
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            filters,
            ..Default::default()
        }))
        .await
        .map_err(|e| Error::Client(e.to_string()))?;
    Ok(containers.into_iter().next().and_then(|c| c.id))
}

/// Create an exec inside `container` and attach its standard streams.
///
/// The attach is always started in raw mode; for non-tty (file-transfer)
/// execs the caller reassembles the runtime's length-prefixed records.
pub async fn attach(
    docker: &Docker,
    container: &str,
    role: &str,
    cmd: &str,
    tty: bool,
) -> Result<(ExecHandle, ExecIo)> {
    let created = docker
        .create_exec(
            container,
            CreateExecOptions {
                user: Some(role.to_string()),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(tty),
                cmd: Some(vec![cmd.to_string()]),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::Client(e.to_string()))?;

    let started = docker
        .start_exec(
            &created.id,
            Some(StartExecOptions {
                detach: false,
                tty: true,
                output_capacity: None,
            }),
        )
        .await
        .map_err(|e| Error::Client(e.to_string()))?;

    match started {
        StartExecResults::Attached { output, input } => Ok((
            ExecHandle {
                docker: docker.clone(),
                id: created.id,
            },
            ExecIo { output, input },
        )),
        StartExecResults::Detached => Err(Error::Client("exec started detached".into())),
    }
}

impl ExecHandle {
    pub async fn resize(&self, win: WinSize) -> Result<()> {
        self.docker
            .resize_exec(
                &self.id,
                ResizeExecOptions {
                    height: win.rows as u16,
                    width: win.columns as u16,
                },
            )
            .await
            .map_err(|e| Error::Client(e.to_string()))
    }

    /// Inspect the exec and SIGKILL its process if it is still running.
    pub async fn kill_if_running(&self) {
        match self.docker.inspect_exec(&self.id).await {
            Ok(inspect) => {
                if inspect.running.unwrap_or(false) {
                    if let Some(pid) = inspect.pid {
                        tracing::info!(exec = %self.id, pid, "killing lingering exec");
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGKILL,
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(exec = %self.id, error = %e, "exec inspect failed");
            }
        }
    }
}

// ── File-transfer record reassembly ──────────────────────────

const RECORD_HEADER: usize = 8;
const MAX_RECORD: usize = 16 * 1024 * 1024;

/// Reassembles the runtime's length-prefixed records from arbitrary read
/// chunks. Record layout: 4 reserved bytes, 4-byte big-endian body length,
/// then the body. One complete body is emitted per output item.
#[derive(Default)]
pub struct RecordSplitter {
    buf: BytesMut,
    need: Option<usize>,
}

impl RecordSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let need = match self.need {
                Some(n) => n,
                None => {
                    if self.buf.len() < RECORD_HEADER {
                        break;
                    }
                    let len = u32::from_be_bytes([
                        self.buf[4],
                        self.buf[5],
                        self.buf[6],
                        self.buf[7],
                    ]) as usize;
                    if len > MAX_RECORD {
                        return Err(Error::Protocol(format!("record body of {len} bytes")));
                    }
                    self.buf.advance(RECORD_HEADER);
                    self.need = Some(len);
                    len
                }
            };
            if self.buf.len() < need {
                break;
            }
            let body = self.buf.split_to(need).freeze();
            if !body.is_empty() {
                out.push(body);
            }
            self.need = None;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(body: &[u8]) -> Vec<u8> {
        let mut rec = vec![0u8; 4];
        rec.extend_from_slice(&(body.len() as u32).to_be_bytes());
        rec.extend_from_slice(body);
        rec
    }

    #[test]
    fn two_records_across_odd_chunks() {
        let mut stream = record(&[b'a'; 10]);
        stream.extend_from_slice(&record(&[b'b'; 5]));

        let mut splitter = RecordSplitter::new();
        let mut bodies = Vec::new();
        for chunk in stream.chunks(7) {
            bodies.extend(splitter.push(chunk).unwrap());
        }

        assert_eq!(bodies.len(), 2);
        assert_eq!(&bodies[0][..], &[b'a'; 10]);
        assert_eq!(&bodies[1][..], &[b'b'; 5]);
    }

    #[test]
    fn header_split_across_chunks() {
        let stream = record(b"payload");
        let mut splitter = RecordSplitter::new();
        assert!(splitter.push(&stream[..3]).unwrap().is_empty());
        assert!(splitter.push(&stream[3..6]).unwrap().is_empty());
        let bodies = splitter.push(&stream[6..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..], b"payload");
    }

    #[test]
    fn concatenation_preserved_regardless_of_chunking() {
        let parts: [&[u8]; 3] = [b"first", b"second record", b"x"];
        let mut stream = Vec::new();
        for p in &parts {
            stream.extend_from_slice(&record(p));
        }
        let expected: Vec<u8> = parts.concat();

        for chunk_size in [1, 2, 3, 8, 11, stream.len()] {
            let mut splitter = RecordSplitter::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                for body in splitter.push(chunk).unwrap() {
                    got.extend_from_slice(&body);
                }
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversize_record_rejected() {
        let mut header = vec![0u8; 4];
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(RecordSplitter::new().push(&header).is_err());
    }
}
