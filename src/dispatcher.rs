//! Completion dispatcher: a poll loop that executes posted operations on
//! readiness and a pool of worker threads draining one shared completion
//! queue.
//!
//! Workers are started at `init` (2x the logical CPU count), all blocking on
//! the same channel; any worker may service any completion, with no
//! per-connection affinity. Each completion is routed by the kind tag
//! embedded in its buffer. `uninit` posts one null-buffer sentinel per
//! worker, joins them all, then stops the poll loop and releases the queue:
//! already-dequeued work finishes, no new work starts.

use std::{
  collections::{HashMap, VecDeque},
  io,
  os::fd::RawFd,
  sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
  },
  thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error};

use crate::{
  buffer::{AcceptBuf, RecvBuf, SendBuf, UdpRecvBuf, UdpSendBuf},
  poller::{NOTIFY_KEY, Poller},
  sync::Mutex,
  tcp::TcpSock,
  udp::UdpSock,
};

/// Direction of interest an operation waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
  Read,
  Write,
}

/// Socket an operation targets. Held weakly: destroying a link does not
/// cancel its in-flight operations, it just makes them complete as silent
/// no-ops.
pub(crate) enum Target {
  Tcp(Weak<TcpSock>),
  Udp(Weak<UdpSock>),
}

/// A posted operation's buffer, tagged by kind.
pub(crate) enum OpBuf {
  Accept(AcceptBuf),
  Send(SendBuf),
  Recv(RecvBuf),
  UdpSend(UdpSendBuf),
  UdpRecv(UdpRecvBuf),
}

impl OpBuf {
  fn dir(&self) -> Dir {
    match self {
      Self::Accept(_) | Self::Recv(_) | Self::UdpRecv(_) => Dir::Read,
      Self::Send(_) | Self::UdpSend(_) => Dir::Write,
    }
  }
}

pub(crate) struct Op {
  pub target: Target,
  pub buf: OpBuf,
}

impl Op {
  fn into_completion(self) -> Completion {
    match self.buf {
      OpBuf::Accept(buf) => Completion::TcpAccept(buf),
      OpBuf::Send(buf) => Completion::TcpSend(buf),
      OpBuf::Recv(buf) => Completion::TcpRecv(buf),
      OpBuf::UdpSend(buf) => Completion::UdpSend(buf),
      OpBuf::UdpRecv(buf) => Completion::UdpRecv(buf),
    }
  }
}

/// A finished operation, carrying its buffer back out. `Shutdown` is the
/// only message without a buffer; it is what distinguishes a real shutdown
/// from an ordinary zero-length completion.
pub(crate) enum Completion {
  TcpAccept(AcceptBuf),
  TcpSend(SendBuf),
  TcpRecv(RecvBuf),
  UdpSend(UdpSendBuf),
  UdpRecv(UdpRecvBuf),
  Shutdown,
}

pub(crate) type DispatchFn = Arc<dyn Fn(Completion) + Send + Sync>;

/// A post that could not be queued; the buffer comes back to the caller so
/// it can be returned to its pool.
pub(crate) struct PostFailure {
  pub error: io::Error,
  pub buf: OpBuf,
}

struct PendingOps {
  fd: RawFd,
  read: VecDeque<Op>,
  write: VecDeque<Op>,
}

type RegMap = HashMap<u64, PendingOps>;

struct Running {
  poller: Arc<Poller>,
  regs: Arc<Mutex<RegMap>>,
  tx: Sender<Completion>,
  workers: Vec<JoinHandle<()>>,
  poll_thread: JoinHandle<()>,
  stop: Arc<AtomicBool>,
}

pub(crate) struct Dispatcher {
  state: Mutex<Option<Running>>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self { state: Mutex::new(None) }
  }

  /// Starts the poll loop and the worker pool. Idempotent.
  pub fn init(&self, callback: DispatchFn) -> io::Result<()> {
    let mut state = self.state.lock();
    if state.is_some() {
      return Ok(());
    }

    let poller = Arc::new(Poller::new()?);
    let regs: Arc<Mutex<RegMap>> = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = unbounded::<Completion>();
    let stop = Arc::new(AtomicBool::new(false));

    let worker_count = 2 * parallelism();
    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
      let rx = rx.clone();
      let callback = Arc::clone(&callback);
      let handle = thread::Builder::new()
        .name(format!("ionet-worker-{i}"))
        .spawn(move || worker_loop(rx, callback))?;
      workers.push(handle);
    }

    let poll_thread = {
      let poller = Arc::clone(&poller);
      let regs = Arc::clone(&regs);
      let tx = tx.clone();
      let stop = Arc::clone(&stop);
      thread::Builder::new()
        .name("ionet-poller".into())
        .spawn(move || poll_loop(&poller, &regs, &tx, &stop))?
    };
    debug!(workers = worker_count, "completion dispatcher started");

    *state = Some(Running { poller, regs, tx, workers, poll_thread, stop });
    Ok(())
  }

  /// Attaches a socket so its completions surface on the shared queue.
  pub fn bind_socket(&self, key: u64, fd: RawFd) -> io::Result<()> {
    let state = self.state.lock();
    let Some(running) = state.as_ref() else {
      return Err(not_running());
    };
    running.regs.lock().insert(
      key,
      PendingOps { fd, read: VecDeque::new(), write: VecDeque::new() },
    );
    if let Err(err) = running.poller.add(fd, key) {
      running.regs.lock().remove(&key);
      return Err(err);
    }
    Ok(())
  }

  /// Detaches a socket, returning the buffers of operations that never ran.
  pub fn unbind(&self, key: u64) -> Vec<OpBuf> {
    let state = self.state.lock();
    let Some(running) = state.as_ref() else {
      return Vec::new();
    };
    let Some(pending) = running.regs.lock().remove(&key) else {
      return Vec::new();
    };
    // The fd may already be gone; epoll forgets closed fds on its own.
    let _ = running.poller.delete(pending.fd);
    pending
      .read
      .into_iter()
      .chain(pending.write)
      .map(|op| op.buf)
      .collect()
  }

  /// Posts one operation and arms interest for it. On failure the buffer is
  /// handed back for recycling.
  pub fn post(&self, key: u64, op: Op) -> Result<(), PostFailure> {
    let state = self.state.lock();
    let Some(running) = state.as_ref() else {
      return Err(PostFailure { error: not_running(), buf: op.buf });
    };
    let mut regs = running.regs.lock();
    let Some(pending) = regs.get_mut(&key) else {
      return Err(PostFailure {
        error: io::Error::new(io::ErrorKind::NotFound, "socket is not attached"),
        buf: op.buf,
      });
    };

    let dir = op.buf.dir();
    let queue = match dir {
      Dir::Read => &mut pending.read,
      Dir::Write => &mut pending.write,
    };
    queue.push_back(op);

    let readable = !pending.read.is_empty();
    let writable = !pending.write.is_empty();
    if let Err(error) = running.poller.arm(pending.fd, key, readable, writable) {
      let queue = match dir {
        Dir::Read => &mut pending.read,
        Dir::Write => &mut pending.write,
      };
      let op = queue.pop_back().expect("the op was just queued");
      return Err(PostFailure { error, buf: op.buf });
    }
    Ok(())
  }

  /// Stops everything: one sentinel per worker, join workers, then wake and
  /// join the poll loop. Pending buffers drop with the registrations.
  pub fn uninit(&self) {
    let running = self.state.lock().take();
    let Some(running) = running else {
      return;
    };
    for _ in 0..running.workers.len() {
      let _ = running.tx.send(Completion::Shutdown);
    }
    for worker in running.workers {
      let _ = worker.join();
    }
    running.stop.store(true, Ordering::Release);
    let _ = running.poller.notify();
    let _ = running.poll_thread.join();
    debug!("completion dispatcher stopped");
  }
}

fn parallelism() -> usize {
  thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn not_running() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "dispatcher is not running")
}

fn worker_loop(rx: Receiver<Completion>, callback: DispatchFn) {
  loop {
    match rx.recv() {
      Ok(Completion::Shutdown) | Err(_) => break,
      Ok(completion) => callback(completion),
    }
  }
}

fn poll_loop(
  poller: &Poller,
  regs: &Mutex<RegMap>,
  tx: &Sender<Completion>,
  stop: &AtomicBool,
) {
  let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 256];
  while !stop.load(Ordering::Acquire) {
    let count = match poller.wait(&mut events) {
      Ok(count) => count,
      // Benign wait interruptions are retried silently.
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => {
        error!(%err, "poll wait failed");
        break;
      }
    };
    for event in &events[..count] {
      let event = Poller::decode(event);
      if event.key == NOTIFY_KEY {
        poller.drain_notify();
        continue;
      }
      if event.readable {
        service(poller, regs, tx, event.key, Dir::Read);
      }
      if event.writable {
        service(poller, regs, tx, event.key, Dir::Write);
      }
    }
  }
}

/// Runs the frontmost pending operation of one direction for a ready socket
/// and re-arms whatever interest remains.
fn service(
  poller: &Poller,
  regs: &Mutex<RegMap>,
  tx: &Sender<Completion>,
  key: u64,
  dir: Dir,
) {
  let op = {
    let mut regs = regs.lock();
    let Some(pending) = regs.get_mut(&key) else {
      return;
    };
    let queue = match dir {
      Dir::Read => &mut pending.read,
      Dir::Write => &mut pending.write,
    };
    match queue.pop_front() {
      Some(op) => op,
      None => return,
    }
  };

  match execute(op) {
    Outcome::Complete(completion) => {
      let _ = tx.send(completion);
    }
    Outcome::Requeue(op) => {
      let mut regs = regs.lock();
      // A concurrently unbound link drops the buffer with the op.
      if let Some(pending) = regs.get_mut(&key) {
        match dir {
          Dir::Read => pending.read.push_front(op),
          Dir::Write => pending.write.push_front(op),
        }
      }
    }
  }

  let mut regs = regs.lock();
  if let Some(pending) = regs.get_mut(&key) {
    let readable = !pending.read.is_empty();
    let writable = !pending.write.is_empty();
    if readable || writable {
      let _ = poller.arm(pending.fd, key, readable, writable);
    }
  }
}

enum Outcome {
  Complete(Completion),
  Requeue(Op),
}

enum Step {
  Complete,
  Requeue,
}

/// Runs one non-blocking syscall for the operation. `WouldBlock` requeues;
/// everything else produces a completion. A dead target completes
/// immediately so the buffer travels back and is recycled without a
/// callback.
fn execute(mut op: Op) -> Outcome {
  let step = match (&op.target, &mut op.buf) {
    (Target::Tcp(weak), OpBuf::Accept(buf)) => match weak.upgrade() {
      None => Step::Complete,
      Some(sock) => match sock.accept() {
        Ok((socket, peer)) => {
          buf.accepted = Some((socket, peer));
          Step::Complete
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Requeue,
        Err(err) => {
          debug!(%err, "accept failed");
          Step::Complete
        }
      },
    },

    (Target::Tcp(weak), OpBuf::Send(buf)) => match weak.upgrade() {
      None => Step::Complete,
      Some(sock) => match sock.send(buf.unsent()) {
        Ok(written) => {
          buf.sent += written;
          if buf.is_fully_sent() { Step::Complete } else { Step::Requeue }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Requeue,
        Err(err) => {
          // The failure surfaces through the receive path; the buffer just
          // goes back to its pool.
          debug!(%err, sent = buf.sent, total = buf.filled().len(), "send failed");
          Step::Complete
        }
      },
    },

    (Target::Tcp(weak), OpBuf::Recv(buf)) => match weak.upgrade() {
      None => {
        buf.len = 0;
        Step::Complete
      }
      Some(sock) => match sock.recv(buf.space()) {
        Ok(received) => {
          buf.len = received;
          Step::Complete
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Requeue,
        Err(err) => {
          // Hard resets complete as a zero-length transfer, which the
          // manager treats as a disconnect.
          debug!(%err, "recv failed");
          buf.len = 0;
          Step::Complete
        }
      },
    },

    (Target::Udp(weak), OpBuf::UdpSend(buf)) => match weak.upgrade() {
      None => Step::Complete,
      Some(sock) => {
        let to = buf.to.take().expect("datagram posted without destination");
        match sock.send_to(buf.filled(), &to) {
          Ok(_) => Step::Complete,
          Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            buf.to = Some(to);
            Step::Requeue
          }
          Err(err) => {
            debug!(%err, "send_to failed");
            Step::Complete
          }
        }
      }
    },

    (Target::Udp(weak), OpBuf::UdpRecv(buf)) => match weak.upgrade() {
      None => {
        buf.len = 0;
        Step::Complete
      }
      Some(sock) => match sock.recv_from(buf.space()) {
        Ok((received, from)) => {
          buf.len = received;
          buf.from = from.as_socket();
          Step::Complete
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Requeue,
        // ICMP port-unreachable noise from earlier sends is not an error
        // of this link; wait for a real datagram.
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => Step::Requeue,
        Err(err) => {
          debug!(%err, "recv_from failed");
          buf.len = 0;
          buf.from = None;
          Step::Complete
        }
      },
    },

    _ => unreachable!("operation posted against the wrong socket family"),
  };

  match step {
    Step::Complete => Outcome::Complete(op.into_completion()),
    Step::Requeue => Outcome::Requeue(op),
  }
}
