/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::buffer::{BufferPool, PooledBuf, RingBuffer};
use crate::extension::ExtensionRegistry;
use crate::http1::{self, BodySize, Request, Response};
use crate::pipeline::{QueueError, ResponseQueue};
use crate::session::{Role, Session, SessionConfig};
use crate::websocket::HEADER_SIZE_MAX;
use log::{debug, error, info, warn};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Socket, Type};
use std::cmp;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const ACCEPT_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

const EVENTS_MAX: usize = 64;
const STOP_WAIT_MAX: Duration = Duration::from_secs(5);

// safety values
pub const HANDLER_THREADS_MAX: usize = 1024;
pub const CONNS_MAX: usize = 1_000_000;

#[derive(Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub conns_max: usize,

    // sized independently from the accept/IO side so slow handlers never
    // block accepting or unrelated connections
    pub handler_threads: usize,

    // outstanding pipelined calls allowed per connection
    pub pipeline_depth: usize,

    pub body_max: usize,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".parse().unwrap(),
            conns_max: 1024,
            handler_threads: 8,
            pipeline_depth: 16,
            body_max: 1_048_576,
            session: SessionConfig::default(),
        }
    }
}

// the application boundary: one call per parsed request. a thrown fault
// (panic) is translated to an error status by the driver
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: &Request) -> Response;

    // opt in to a websocket upgrade for this request
    fn accept_websocket(&self, _req: &Request) -> bool {
        false
    }

    // borrow the established session for the lifetime of the upgraded
    // request
    fn websocket(&self, _req: &Request, _session: &mut Session) {}
}

type Job = Box<dyn FnOnce() + Send>;

// bounded pool of handler threads consuming a shared job queue
struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(count: usize) -> Self {
        assert!(count > 0);

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut threads = Vec::with_capacity(count);

        for _ in 0..count {
            let receiver = Arc::clone(&receiver);

            threads.push(thread::spawn(move || loop {
                let job = {
                    let receiver = receiver.lock().unwrap();

                    receiver.recv()
                };

                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }));
        }

        Self {
            sender: Some(sender),
            threads,
        }
    }

    fn execute(&self, job: Job) {
        // receivers only disconnect at shutdown
        let _ = self.sender.as_ref().unwrap().send(job);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

struct ConnControl {
    stream: TcpStream,
    rq: ResponseQueue,
}

impl ConnControl {
    fn cancel(&self) {
        self.rq.cancel();

        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct ConnTable {
    entries: Mutex<Slab<Arc<ConnControl>>>,
    emptied: Condvar,
}

impl ConnTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Slab::with_capacity(capacity)),
            emptied: Condvar::new(),
        }
    }

    // returns None at capacity
    fn insert(&self, control: Arc<ConnControl>) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap();

        if entries.len() == entries.capacity() {
            return None;
        }

        Some(entries.insert(control))
    }

    fn remove(&self, key: usize) {
        let mut entries = self.entries.lock().unwrap();

        entries.remove(key);

        if entries.is_empty() {
            self.emptied.notify_all();
        }
    }

    fn cancel_all(&self) {
        let entries = self.entries.lock().unwrap();

        for (_, control) in entries.iter() {
            control.cancel();
        }
    }

    fn wait_empty(&self, timeout: Duration) -> bool {
        let mut entries = self.entries.lock().unwrap();

        let deadline = std::time::Instant::now() + timeout;

        while !entries.is_empty() {
            let now = std::time::Instant::now();

            if now >= deadline {
                return false;
            }

            let (g, _) = self.emptied.wait_timeout(entries, deadline - now).unwrap();

            entries = g;
        }

        true
    }
}

enum ConnError {
    Io(io::Error),
    Http(http1::Error),
    Queue(QueueError),
    Done,
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<http1::Error> for ConnError {
    fn from(e: http1::Error) -> Self {
        Self::Http(e)
    }
}

impl From<QueueError> for ConnError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

struct Connection {
    reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    peer_addr: SocketAddr,
    ring: RingBuffer<PooledBuf>,
    rq: ResponseQueue,
    handler: Arc<dyn Handler>,
    workers: Arc<WorkerPool>,
    extensions: Arc<ExtensionRegistry>,
    buffers: Arc<BufferPool>,
    config: Config,
}

impl Connection {
    fn run(mut self) {
        debug!("connection from {}: starting", self.peer_addr);

        match self.serve() {
            Ok(()) | Err(ConnError::Done) => {
                debug!("connection from {}: finished", self.peer_addr);
            }
            Err(ConnError::Queue(_)) => {
                debug!("connection from {}: cancelled", self.peer_addr);
            }
            Err(ConnError::Io(e)) => {
                debug!("connection from {}: i/o error: {}", self.peer_addr, e);
            }
            Err(ConnError::Http(e)) => {
                debug!("connection from {}: protocol error: {}", self.peer_addr, e);

                // flush whatever was already in flight, then reject
                let _ = self.rq.wait_empty();

                let resp = match e {
                    http1::Error::UnsupportedTransferEncoding => {
                        Response::text(501, "Not Implemented", "transfer encoding not supported\n")
                    }
                    _ => Response::text(400, "Bad Request", "bad request\n"),
                };

                self.respond_directly(resp);
            }
        }

        self.rq.cancel();

        let _ = self.reader.shutdown(Shutdown::Both);
    }

    fn serve(&mut self) -> Result<(), ConnError> {
        loop {
            // parse the next pipelined request head
            let (mut req, body_size) = match self.next_request()? {
                Some(parsed) => parsed,
                None => return Ok(()),
            };

            // interim response expected before the client sends the body
            if req.expects_100() && body_size != BodySize::NoBody {
                let mut writer = self.writer.lock().unwrap();

                http1::write_100_continue(&mut *writer)?;
            }

            if let BodySize::Known(size) = body_size {
                if size > self.config.body_max {
                    self.drain_and_respond(Response::text(
                        413,
                        "Payload Too Large",
                        "payload too large\n",
                    ))?;

                    return Ok(());
                }

                req.body = self.read_body(size)?;
            }

            // upgrade requests short-circuit the response path entirely
            if http1::is_upgrade_request(&req) && self.handler.accept_websocket(&req) {
                self.upgrade(&req)?;

                return Ok(());
            }

            let persistent = req.is_persistent();

            // bound the number of outstanding calls on this connection
            self.rq.wait_capacity(self.config.pipeline_depth)?;

            let id = self.rq.started()?;

            let handler = Arc::clone(&self.handler);
            let rq = self.rq.clone();
            let writer = Arc::clone(&self.writer);

            self.workers.execute(Box::new(move || {
                let resp = match catch_unwind(AssertUnwindSafe(|| handler.handle(&req))) {
                    Ok(resp) => resp,
                    Err(_) => {
                        error!("handler panicked for {} {}", req.method, req.uri);

                        Response::text(500, "Internal Server Error", "internal error\n")
                    }
                };

                // serialize concurrent responders onto the ordered stream
                if rq.wait_turn(id).is_err() {
                    return;
                }

                let mut out = Vec::with_capacity(resp.body.len() + 256);

                if http1::write_response(&mut out, &resp, persistent).is_err() {
                    // writing to a Vec cannot fail; keep the queue moving
                    // anyway
                    out.clear();
                }

                let write_result = {
                    let mut writer = writer.lock().unwrap();

                    writer.write_all(&out)
                };

                if let Err(e) = write_result {
                    debug!("response write failed: {}", e);

                    rq.cancel();
                    return;
                }

                if let Err(e) = rq.completed(id) {
                    if e == QueueError::NotHead {
                        // a driver bug, fatal to this connection
                        error!("response queue corrupted: {}", e);
                    }

                    rq.cancel();
                }
            }));

            if !persistent {
                // drain outstanding responses, then close
                self.rq.wait_empty()?;

                return Ok(());
            }
        }
    }

    // read until a complete request head is buffered. returns None on a
    // clean EOF between requests
    #[allow(clippy::type_complexity)]
    fn next_request(&mut self) -> Result<Option<(Request, BodySize)>, ConnError> {
        loop {
            if self.ring.read_avail() > 0 {
                if let Some((req, size, body_size)) =
                    http1::parse_request_head(self.ring.read_buf())?
                {
                    self.ring.read_commit(size);

                    return Ok(Some((req, body_size)));
                }
            }

            let buf = self.ring.write_buf();

            if buf.is_empty() {
                self.drain_and_respond(Response::text(
                    431,
                    "Request Header Fields Too Large",
                    "request too large\n",
                ))?;

                return Err(ConnError::Done);
            }

            match self.reader.read(buf) {
                Ok(0) => {
                    if self.ring.read_avail() > 0 {
                        // EOF mid-request
                        return Err(ConnError::Io(io::Error::from(
                            io::ErrorKind::UnexpectedEof,
                        )));
                    }

                    // wait for any outstanding responses before closing
                    let _ = self.rq.wait_empty();

                    return Ok(None);
                }
                Ok(size) => self.ring.write_commit(size),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_body(&mut self, size: usize) -> Result<Vec<u8>, ConnError> {
        let mut body = Vec::with_capacity(size);

        let avail = cmp::min(self.ring.read_avail(), size);

        body.extend_from_slice(&self.ring.read_buf()[..avail]);
        self.ring.read_commit(avail);

        let mut buf = [0; 8192];

        while body.len() < size {
            let want = cmp::min(buf.len(), size - body.len());

            match self.reader.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(ConnError::Io(io::Error::from(
                        io::ErrorKind::UnexpectedEof,
                    )))
                }
                Ok(n) => body.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(body)
    }

    // flush earlier pipelined responses, then write one final response
    fn drain_and_respond(&mut self, resp: Response) -> Result<(), ConnError> {
        self.rq.wait_empty()?;

        self.respond_directly(resp);

        Ok(())
    }

    fn respond_directly(&self, resp: Response) {
        let mut out = Vec::with_capacity(resp.body.len() + 256);

        if http1::write_response(&mut out, &resp, false).is_ok() {
            let mut writer = self.writer.lock().unwrap();

            let _ = writer.write_all(&out);
        }
    }

    fn upgrade(&mut self, req: &Request) -> Result<(), ConnError> {
        let key = match http1::validate_upgrade(req) {
            Ok(key) => key,
            Err(e) => {
                debug!("connection from {}: bad upgrade: {}", self.peer_addr, e);

                self.drain_and_respond(Response::text(400, "Bad Request", "bad upgrade\n"))?;

                return Ok(());
            }
        };

        let accept = http1::accept_key(key);

        let offers = match req.header("Sec-WebSocket-Extensions") {
            Some(value) => http1::parse_extension_offers(value).unwrap_or_default(),
            None => Vec::new(),
        };

        let (active, ext_header) = self.extensions.negotiate_server(&offers);

        // every earlier pipelined response flushes before the protocol
        // switches
        self.rq.wait_empty()?;

        {
            let mut out = Vec::new();

            http1::write_upgrade_response(&mut out, &accept, ext_header.as_deref(), None)?;

            let mut writer = self.writer.lock().unwrap();

            writer.write_all(&out)?;
        }

        info!("connection from {}: switched to websocket", self.peer_addr);

        // bytes the client sent ahead of the 101 belong to the session
        let mut early = vec![0; self.ring.read_avail()];
        early.copy_from_slice(self.ring.read_buf());
        self.ring.read_commit(early.len());

        let reader = io::Cursor::new(early).chain(self.reader.try_clone()?);
        let writer = self.reader.try_clone()?;

        let shutdown_stream = self.reader.try_clone()?;
        let shutdown = move || {
            let _ = shutdown_stream.shutdown(Shutdown::Both);
        };

        let mut session = Session::start(
            reader,
            writer,
            shutdown,
            Role::Server,
            active,
            self.config.session.clone(),
            &self.buffers,
        );

        self.handler.websocket(req, &mut session);

        // the handler is done with the session; finish the close
        // handshake if it is still open
        let _ = session.close(None);
        let _ = session.close_reason_timeout(Duration::from_secs(5));

        Ok(())
    }
}

// the engine: a non-blocking accept loop, per-connection drivers, and a
// separately-sized handler pool gluing transport, response queue, and
// application handler together
pub struct Server {
    listener_thread: Option<thread::JoinHandle<()>>,
    waker: Arc<Waker>,
    stopping: Arc<AtomicBool>,
    conns: Arc<ConnTable>,
    local_addr: SocketAddr,
}

impl Server {
    pub fn start<H: Handler>(
        config: Config,
        handler: H,
        extensions: ExtensionRegistry,
    ) -> Result<Self, io::Error> {
        assert!(config.handler_threads > 0 && config.handler_threads <= HANDLER_THREADS_MAX);
        assert!(config.conns_max > 0 && config.conns_max <= CONNS_MAX);

        let socket = Socket::new(Domain::for_address(config.listen), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&config.listen.into())?;
        socket.listen(128)?;

        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;

        let local_addr = std_listener.local_addr()?;

        let mut listener = mio::net::TcpListener::from_std(std_listener);

        let poll = Poll::new()?;

        poll.registry()
            .register(&mut listener, ACCEPT_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let stopping = Arc::new(AtomicBool::new(false));
        let conns = Arc::new(ConnTable::new(config.conns_max));

        let workers = Arc::new(WorkerPool::new(config.handler_threads));
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let extensions = Arc::new(extensions);

        let block_size = cmp::max(16_384, config.session.max_frame_size + HEADER_SIZE_MAX);
        let buffers = BufferPool::new(block_size, config.conns_max);

        let listener_thread = {
            let stopping = Arc::clone(&stopping);
            let conns = Arc::clone(&conns);

            thread::spawn(move || {
                let mut poll = poll;

                Self::accept_loop(
                    &mut poll, &mut listener, &stopping, &conns, &workers, &handler, &extensions,
                    &buffers, &config,
                );
            })
        };

        info!("listening on {}", local_addr);

        Ok(Self {
            listener_thread: Some(listener_thread),
            waker,
            stopping,
            conns,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_loop(
        poll: &mut Poll,
        listener: &mut mio::net::TcpListener,
        stopping: &Arc<AtomicBool>,
        conns: &Arc<ConnTable>,
        workers: &Arc<WorkerPool>,
        handler: &Arc<dyn Handler>,
        extensions: &Arc<ExtensionRegistry>,
        buffers: &Arc<BufferPool>,
        config: &Config,
    ) {
        let mut events = Events::with_capacity(EVENTS_MAX);

        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!("poll failed: {}", e);
                break;
            }

            if stopping.load(Ordering::SeqCst) {
                break;
            }

            for event in events.iter() {
                if event.token() != ACCEPT_TOKEN {
                    continue;
                }

                loop {
                    let (stream, peer_addr) = match listener.accept() {
                        Ok(ret) => ret,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            error!("accept error: {}", e);
                            break;
                        }
                    };

                    debug!("accepted connection from {}", peer_addr);

                    // hand the socket to a blocking per-connection driver
                    let stream = unsafe {
                        // SAFETY: the fd comes straight from into_raw_fd
                        // and is owned by exactly the new TcpStream
                        TcpStream::from_raw_fd(stream.into_raw_fd())
                    };

                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }

                    let _ = stream.set_nodelay(true);

                    Self::spawn_connection(
                        stream, peer_addr, conns, workers, handler, extensions, buffers, config,
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        conns: &Arc<ConnTable>,
        workers: &Arc<WorkerPool>,
        handler: &Arc<dyn Handler>,
        extensions: &Arc<ExtensionRegistry>,
        buffers: &Arc<BufferPool>,
        config: &Config,
    ) {
        let rq = ResponseQueue::new();

        let control_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!("connection from {}: clone failed: {}", peer_addr, e);
                return;
            }
        };

        let writer = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!("connection from {}: clone failed: {}", peer_addr, e);
                return;
            }
        };

        let control = Arc::new(ConnControl {
            stream: control_stream,
            rq: rq.clone(),
        });

        let key = match conns.insert(control) {
            Some(key) => key,
            None => {
                warn!("connection from {}: too many connections", peer_addr);
                return;
            }
        };

        let conn = Connection {
            reader: stream,
            writer: Arc::new(Mutex::new(writer)),
            peer_addr,
            ring: RingBuffer::new(buffers.checkout()),
            rq,
            handler: Arc::clone(handler),
            workers: Arc::clone(workers),
            extensions: Arc::clone(extensions),
            buffers: Arc::clone(buffers),
            config: config.clone(),
        };

        let conns = Arc::clone(conns);

        thread::spawn(move || {
            conn.run();

            conns.remove(key);
        });
    }

    // stop accepting, cancel every connection, and wait for the drivers
    // to drain
    pub fn stop(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("stopping");

        let _ = self.waker.wake();

        if let Some(thread) = self.listener_thread.take() {
            let _ = thread.join();
        }

        self.conns.cancel_all();

        if !self.conns.wait_empty(STOP_WAIT_MAX) {
            warn!("some connections did not stop in time");
        }

        info!("stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
