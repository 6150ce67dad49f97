//! Go/done signalling between the controller and the workers.
//!
//! Every worker owns one local socket connection to the controller. A cycle
//! is a [`ToWorker::Go`] from the controller followed by exactly one
//! [`FromWorker::Done`] (or [`FromWorker::Fatal`]) from the worker, so a worker
//! can never hold more than one pending go signal.
//!
//! Messages are framed as a 4-byte big-endian length followed by the
//! [`bincode`] payload. Sending is preceded by a release fence and receiving
//! is followed by an acquire fence, which orders the accesses to the shared
//! region around the signals.
use crate::error::PoolError;
use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use interprocess::local_socket::{
    traits::{ListenerExt, Stream as _},
    GenericNamespaced, Listener, ListenerOptions, Stream, ToNsName,
};
use log::{debug, info, trace, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    io::{BufReader, Read, Write},
    sync::atomic::{fence, AtomicUsize, Ordering},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const HALT_GRACE: Duration = Duration::from_secs(1);

/// Messages from the controller to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToWorker {
    /// Run one cycle.
    Go,

    /// Close the simulator and exit.
    Halt,
}

/// Messages from a worker to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromWorker {
    /// First message after connecting.
    Hello {
        /// Slot of the worker.
        index: usize,
        /// Process id of the worker.
        pid: u32,
    },

    /// The result record of the cycle is written.
    Done {
        /// Slot of the worker.
        index: usize,
        /// Instruction of the episode the record belongs to.
        instruction: String,
    },

    /// The worker cannot continue.
    Fatal {
        /// Slot of the worker.
        index: usize,
        /// Description of the failure.
        message: String,
    },
}

/// Writes one framed message.
pub fn send_message<T: Serialize>(conn: &mut impl Write, msg: &T) -> Result<()> {
    let payload = bincode::serialize(msg)?;
    let payload_len = (payload.len() as u32).to_be_bytes();
    fence(Ordering::Release);
    conn.write_all(&payload_len)?;
    conn.write_all(&payload)?;
    conn.flush()?;
    Ok(())
}

/// Reads one framed message.
pub fn receive_message<T: DeserializeOwned>(conn: &mut impl Read) -> Result<T> {
    let mut content_len = [0u8; 4];
    conn.read_exact(&mut content_len)?;
    let len = u32::from_be_bytes(content_len);
    let mut buffer = vec![0u8; len as usize];
    conn.read_exact(&mut buffer)?;
    fence(Ordering::Acquire);
    Ok(bincode::deserialize(&buffer)?)
}

/// Returns a socket name unique to this process.
pub fn socket_name() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "vecsim-{}-{}.sock",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Worker side of the connection.
pub struct WorkerLink {
    index: usize,
    conn: BufReader<Stream>,
}

impl WorkerLink {
    /// Connects to the controller and introduces the worker.
    pub fn connect(socket_name: &str, index: usize) -> Result<Self> {
        let name = socket_name
            .to_ns_name::<GenericNamespaced>()
            .with_context(|| format!("invalid socket name {}", socket_name))?;
        let conn = Stream::connect(name)
            .with_context(|| format!("worker {} connecting to {}", index, socket_name))?;
        let mut link = Self {
            index,
            conn: BufReader::new(conn),
        };
        link.send(&FromWorker::Hello {
            index,
            pid: std::process::id(),
        })?;
        Ok(link)
    }

    fn send(&mut self, msg: &FromWorker) -> Result<()> {
        send_message(self.conn.get_mut(), msg)
    }

    /// Blocks until the controller sends a command.
    pub fn wait(&mut self) -> Result<ToWorker> {
        receive_message(&mut self.conn)
    }

    /// Reports that the result record of the cycle is written.
    pub fn done(&mut self, instruction: &str) -> Result<()> {
        self.send(&FromWorker::Done {
            index: self.index,
            instruction: instruction.to_string(),
        })
    }

    /// Reports a failure the worker cannot recover from.
    pub fn fatal(&mut self, message: impl Into<String>) -> Result<()> {
        self.send(&FromWorker::Fatal {
            index: self.index,
            message: message.into(),
        })
    }
}

/// Listening socket the workers connect to.
pub struct SignalServer {
    name: String,
    listener: Listener,
}

impl SignalServer {
    /// Binds a socket with the given name.
    pub fn bind(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let ns_name = name
            .as_str()
            .to_ns_name::<GenericNamespaced>()
            .with_context(|| format!("invalid socket name {}", name))?;
        let listener = ListenerOptions::new()
            .name(ns_name)
            .create_sync()
            .with_context(|| format!("binding {}", name))?;
        debug!("listening on {}", name);
        Ok(Self { name, listener })
    }

    /// Name workers connect to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until `n` workers with distinct slots have connected.
    ///
    /// Connections are accepted on a helper thread. If the timeout expires
    /// the thread is left blocked in `accept` until the process exits.
    pub fn accept(self, n: usize, timeout: Duration) -> Result<ControllerLink> {
        let (tx, rx) = bounded(n);
        let listener = self.listener;
        thread::spawn(move || {
            for conn in listener.incoming().take(n) {
                let hello = conn.map_err(anyhow::Error::from).and_then(|conn| {
                    let mut conn = BufReader::new(conn);
                    match receive_message(&mut conn)? {
                        FromWorker::Hello { index, pid } => Ok((index, pid, conn)),
                        msg => bail!("expected hello, got {:?}", msg),
                    }
                });
                if tx.send(hello).is_err() {
                    return;
                }
            }
        });

        let deadline = Instant::now() + timeout;
        let mut conns: Vec<Option<BufReader<Stream>>> = (0..n).map(|_| None).collect();
        for connected in 0..n {
            let (index, pid, conn) = match rx.recv_deadline(deadline) {
                Ok(hello) => hello.map_err(|e| PoolError::Handshake(format!("{:#}", e)))?,
                Err(_) => {
                    return Err(PoolError::Handshake(format!(
                        "{} of {} workers connected within {:?}",
                        connected, n, timeout
                    ))
                    .into())
                }
            };
            match conns.get_mut(index) {
                Some(slot) if slot.is_none() => *slot = Some(conn),
                _ => {
                    return Err(PoolError::Handshake(format!(
                        "unexpected worker index {} (pid {})",
                        index, pid
                    ))
                    .into())
                }
            }
            info!("worker {} connected (pid {})", index, pid);
        }

        let (events_tx, events) = unbounded();
        let links = conns
            .into_iter()
            .enumerate()
            .filter_map(|(index, conn)| conn.map(|conn| (index, conn)))
            .map(|(index, conn)| {
                let (cmd_tx, cmd_rx) = unbounded();
                let events_tx = events_tx.clone();
                let thread = thread::spawn(move || serve(index, conn, cmd_rx, events_tx));
                LinkHandle {
                    cmds: cmd_tx,
                    thread: Some(thread),
                }
            })
            .collect();
        Ok(ControllerLink { links, events })
    }
}

/// What a link thread observed from its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkEvent {
    Done { index: usize, instruction: String },
    Failed { index: usize, message: String },
    Exited { index: usize },
}

impl LinkEvent {
    fn index(&self) -> usize {
        match self {
            Self::Done { index, .. } | Self::Failed { index, .. } | Self::Exited { index } => *index,
        }
    }
}

/// Forwards commands to one worker and its replies to the controller.
fn serve(
    index: usize,
    mut conn: BufReader<Stream>,
    cmds: Receiver<ToWorker>,
    events: Sender<LinkEvent>,
) {
    for cmd in cmds.iter() {
        if let Err(e) = send_message(conn.get_mut(), &cmd) {
            debug!("worker {} unreachable: {:#}", index, e);
            // A worker that failed on startup may have left its report behind
            let event = match receive_message::<FromWorker>(&mut conn) {
                Ok(FromWorker::Fatal { message, .. }) => LinkEvent::Failed { index, message },
                _ => LinkEvent::Exited { index },
            };
            let _ = events.send(event);
            return;
        }
        if cmd == ToWorker::Halt {
            return;
        }
        let event = match receive_message::<FromWorker>(&mut conn) {
            Ok(FromWorker::Done { instruction, .. }) => LinkEvent::Done { index, instruction },
            Ok(FromWorker::Fatal { message, .. }) => LinkEvent::Failed { index, message },
            Ok(msg) => LinkEvent::Failed {
                index,
                message: format!("unexpected message {:?}", msg),
            },
            Err(e) => {
                debug!("worker {} disconnected: {:#}", index, e);
                LinkEvent::Exited { index }
            }
        };
        let alive = matches!(event, LinkEvent::Done { .. });
        if events.send(event).is_err() || !alive {
            return;
        }
    }
}

struct LinkHandle {
    cmds: Sender<ToWorker>,
    thread: Option<JoinHandle<()>>,
}

/// Controller side of the connections to all workers.
pub struct ControllerLink {
    links: Vec<LinkHandle>,
    events: Receiver<LinkEvent>,
}

impl ControllerLink {
    /// Number of connected workers.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no worker is connected.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Runs one cycle on the workers in `indices` and returns the instruction
    /// reported by each, in the order of `indices`.
    ///
    /// With `timeout` set to `None` this blocks until every worker reports.
    pub fn cycle(&self, indices: &[usize], timeout: Option<Duration>) -> Result<Vec<String>> {
        for &index in indices {
            trace!("go {}", index);
            let link = self
                .links
                .get(index)
                .ok_or_else(|| PoolError::Protocol(format!("no worker {}", index)))?;
            link.cmds
                .send(ToWorker::Go)
                .map_err(|_| PoolError::WorkerExited { index })?;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut instructions: Vec<Option<String>> = vec![None; self.links.len()];
        let mut pending = indices.len();
        while pending > 0 {
            let event = match deadline {
                Some(deadline) => self.events.recv_deadline(deadline).map_err(|e| match e {
                    RecvTimeoutError::Timeout => PoolError::CycleTimeout { pending },
                    RecvTimeoutError::Disconnected => {
                        PoolError::Protocol("all links closed".to_string())
                    }
                })?,
                None => self
                    .events
                    .recv()
                    .map_err(|_| PoolError::Protocol("all links closed".to_string()))?,
            };
            match event {
                LinkEvent::Done { index, instruction } => {
                    trace!("done {}", index);
                    match instructions.get_mut(index) {
                        Some(slot) if slot.is_none() && indices.contains(&index) => {
                            *slot = Some(instruction);
                            pending -= 1;
                        }
                        _ => {
                            return Err(PoolError::Protocol(format!(
                                "unexpected done from worker {}",
                                index
                            ))
                            .into())
                        }
                    }
                }
                LinkEvent::Failed { index, message } => {
                    return Err(PoolError::WorkerFailed { index, message }.into())
                }
                e @ LinkEvent::Exited { .. } => {
                    return Err(PoolError::WorkerExited { index: e.index() }.into())
                }
            }
        }

        Ok(indices
            .iter()
            .map(|&i| instructions[i].take().unwrap_or_default())
            .collect())
    }

    /// Asks every worker to exit and waits for the link threads.
    ///
    /// Link threads blocked on a worker that never replies are detached.
    pub fn halt(&mut self) {
        for (index, link) in self.links.iter().enumerate() {
            if link.cmds.send(ToWorker::Halt).is_err() {
                debug!("link {} already closed", index);
            }
        }
        let deadline = Instant::now() + HALT_GRACE;
        for (index, link) in self.links.iter_mut().enumerate() {
            let Some(thread) = link.thread.take() else {
                continue;
            };
            while !thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if !thread.is_finished() {
                warn!("link thread {} is still waiting for its worker", index);
            } else if thread.join().is_err() {
                warn!("link thread {} panicked", index);
            }
        }
    }
}

impl Drop for ControllerLink {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_framing() -> Result<()> {
        let mut buf = vec![];
        send_message(
            &mut buf,
            &FromWorker::Done {
                index: 3,
                instruction: "pick".to_string(),
            },
        )?;
        send_message(&mut buf, &ToWorker::Halt)?;
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(buf.len() - 4 - len, 8);

        let mut rdr = buf.as_slice();
        let msg: FromWorker = receive_message(&mut rdr)?;
        assert_eq!(
            msg,
            FromWorker::Done {
                index: 3,
                instruction: "pick".to_string()
            }
        );
        let msg: ToWorker = receive_message(&mut rdr)?;
        assert_eq!(msg, ToWorker::Halt);
        assert!(receive_message::<ToWorker>(&mut rdr).is_err());
        Ok(())
    }

    #[test]
    fn test_socket_names_are_unique() {
        assert_ne!(socket_name(), socket_name());
    }

    #[test]
    fn test_cycle() -> Result<()> {
        let server = SignalServer::bind(socket_name())?;
        let name = server.name().to_string();
        let workers: Vec<_> = (0..2)
            .map(|index| {
                let name = name.clone();
                thread::spawn(move || -> Result<usize> {
                    let mut link = WorkerLink::connect(&name, index)?;
                    let mut cycles = 0;
                    while link.wait()? == ToWorker::Go {
                        cycles += 1;
                        link.done(&format!("task {} cycle {}", index, cycles))?;
                    }
                    Ok(cycles)
                })
            })
            .collect();

        let mut link = server.accept(2, Duration::from_secs(10))?;
        assert_eq!(link.len(), 2);
        let out = link.cycle(&[0, 1], None)?;
        assert_eq!(out, vec!["task 0 cycle 1", "task 1 cycle 1"]);
        let out = link.cycle(&[1], Some(Duration::from_secs(10)))?;
        assert_eq!(out, vec!["task 1 cycle 2"]);
        link.halt();

        let cycles: Vec<usize> = workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        assert_eq!(cycles, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_fatal_and_handshake_timeout() -> Result<()> {
        let server = SignalServer::bind(socket_name())?;
        let name = server.name().to_string();
        let worker = thread::spawn(move || -> Result<()> {
            let mut link = WorkerLink::connect(&name, 0)?;
            link.wait()?;
            link.fatal("setup failed")
        });
        let link = server.accept(1, Duration::from_secs(10))?;
        let err = link.cycle(&[0], None).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PoolError>(),
            Some(&PoolError::WorkerFailed {
                index: 0,
                message: "setup failed".to_string()
            })
        );
        worker.join().unwrap()?;

        let server = SignalServer::bind(socket_name())?;
        let err = server.accept(1, Duration::from_millis(100)).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<PoolError>(),
            Some(PoolError::Handshake(_))
        ));
        Ok(())
    }
}
