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
use crate::channel::{self, Deferred, OverflowPolicy, RecvError, RecvTimeoutError, SendError};
use crate::extension::{active_rsv_bits, Extension, ExtensionError};
use crate::websocket::{
    self, codes, write_frame, CloseReason, Frame, FrameDecoder, FrameType, MessageAssembler,
    PayloadDisplay, RsvBits, WireFrame, HEADER_SIZE_MAX, OPCODE_CLOSE, OPCODE_CONTINUATION,
    OPCODE_PING,
};
use log::{debug, log_enabled, trace};
use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::num::Wrapping;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Pseudorandom number generator based on [xorshift*].
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
fn random() -> u64 {
    thread_local! {
        static RNG: Cell<Wrapping<u64>> = Cell::new(Wrapping(prng_seed()));
    }

    fn prng_seed() -> u64 {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        // Any non-zero seed will do
        let mut seed = 0;
        while seed == 0 {
            let mut hasher = DefaultHasher::new();
            hasher.write_usize(COUNTER.fetch_add(1, Ordering::Relaxed));
            seed = hasher.finish();
        }
        seed
    }

    RNG.with(|rng| {
        let mut x = rng.get();
        debug_assert_ne!(x.0, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        rng.set(x);
        x.0.wrapping_mul(0x2545_f491_4f6c_dd1d)
    })
}

fn gen_mask() -> [u8; 4] {
    (random() as u32).to_be_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] websocket::Error),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("i/o failure: {0:?}")]
    Io(io::ErrorKind),

    #[error("frame channel overflow")]
    Overflow,

    #[error("session timed out")]
    TimedOut,

    #[error("session cancelled")]
    Cancelled,
}

// how the session's close handshake resolved: the peer's stated reason
// (or None when the peer sent an empty close), or the local fault
pub type CloseOutcome = Result<Option<CloseReason>, SessionError>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    // bounds both a single frame and a reassembled message
    pub max_frame_size: usize,

    // None disables keep-alive pings and the idle timeout
    pub ping_interval: Option<Duration>,

    // inbound silence tolerated before the session is forced closed.
    // enforced only when ping_interval is set
    pub timeout: Duration,

    pub incoming_capacity: usize,
    pub incoming_policy: OverflowPolicy,
    pub outgoing_capacity: usize,
    pub outgoing_policy: OverflowPolicy,

    // false makes the session raw: no automatic pong replies, and pongs
    // are delivered to the application instead of being consumed
    pub auto_pong: bool,

    // whether a channel overflow under the Close policy tears down the
    // whole session or only the affected direction
    pub overflow_closes_session: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 131_072,
            ping_interval: None,
            timeout: Duration::from_secs(15),
            incoming_capacity: 16,
            incoming_policy: OverflowPolicy::Suspend,
            outgoing_capacity: 16,
            outgoing_policy: OverflowPolicy::Suspend,
            auto_pong: true,
            overflow_closes_session: true,
        }
    }
}

#[derive(Default)]
struct Flags {
    close_sent: bool,
    close_received: bool,
    reader_done: bool,
    writer_done: bool,
}

struct Shared {
    flags: Mutex<Flags>,
    close_reason: Deferred<CloseOutcome>,
    last_activity: Mutex<Instant>,
    cancelled: AtomicBool,
    shutdown: Box<dyn Fn() + Send + Sync>,
}

impl Shared {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_close_sent(&self) {
        self.flags.lock().unwrap().close_sent = true;
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

enum Flow {
    Continue,
    Stop,
}

// run a frame through the activated extensions in installation order
fn apply_pipeline<F>(
    extensions: &mut [Box<dyn Extension>],
    frame: Frame,
    mut apply: F,
) -> Result<Frame, ExtensionError>
where
    F: FnMut(&mut Box<dyn Extension>, Frame) -> Result<Frame, ExtensionError>,
{
    let mut frame = frame;

    for ext in extensions.iter_mut() {
        frame = apply(ext, frame)?;
    }

    Ok(frame)
}

struct ReaderTask<R: Read> {
    stream: R,
    ring: RingBuffer<PooledBuf>,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    incoming: channel::Sender<Frame>,
    control: channel::Sender<Frame>,
    extensions: Arc<Mutex<Vec<Box<dyn Extension>>>>,
    shared: Arc<Shared>,
    config: SessionConfig,
    delivering: bool,
}

impl<R: Read> ReaderTask<R> {
    fn run(mut self) {
        'outer: loop {
            // process everything decodable before reading more
            loop {
                let wire = match self.decoder.decode(&mut self.ring) {
                    Ok(Some(wire)) => wire,
                    Ok(None) => break,
                    Err(e) => {
                        self.fault(
                            CloseReason::new(e.close_code(), "protocol fault"),
                            SessionError::Protocol(e),
                        );
                        break 'outer;
                    }
                };

                if log_enabled!(log::Level::Trace) {
                    trace!(
                        "IN ws opcode={} fin={} {}",
                        wire.opcode,
                        wire.fin,
                        PayloadDisplay(&wire.data)
                    );
                }

                let frame = match self.assembler.add(wire) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        self.fault(
                            CloseReason::new(e.close_code(), "protocol fault"),
                            SessionError::Protocol(e),
                        );
                        break 'outer;
                    }
                };

                match self.process(frame) {
                    Flow::Continue => {}
                    Flow::Stop => break 'outer,
                }
            }

            let buf = self.ring.write_buf();
            assert!(!buf.is_empty());

            match self.stream.read(buf) {
                Ok(0) => {
                    self.peer_gone();
                    break;
                }
                Ok(size) => {
                    self.ring.write_commit(size);
                    self.shared.touch();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if !self.shared.is_cancelled() {
                        self.shared
                            .close_reason
                            .set(Err(SessionError::Io(e.kind())));
                        self.incoming.close_faulted();
                        self.control.cancel();
                    }
                    break;
                }
            }
        }

        let mut flags = self.shared.flags.lock().unwrap();
        flags.reader_done = true;
    }

    fn process(&mut self, frame: Frame) -> Flow {
        match frame.frame_type {
            FrameType::Close => {
                let reason = match frame.close_reason() {
                    Ok(reason) => reason,
                    Err(e) => {
                        self.fault(
                            CloseReason::new(e.close_code(), "protocol fault"),
                            SessionError::Protocol(e),
                        );
                        return Flow::Stop;
                    }
                };

                let already_sent = {
                    let mut flags = self.shared.flags.lock().unwrap();
                    flags.close_received = true;

                    flags.close_sent
                };

                // the first close received is authoritative
                self.shared.close_reason.set(Ok(reason.clone()));

                if !already_sent {
                    // auto-reply before the incoming side finishes
                    let _ = self.control.send(Frame::close(reason));
                }

                self.incoming.close();

                Flow::Stop
            }
            FrameType::Ping => {
                if self.config.auto_pong {
                    let _ = self.control.send(Frame::pong(frame.data.clone()));
                }

                self.deliver(frame)
            }
            FrameType::Pong => {
                if self.config.auto_pong {
                    // consumed as a keep-alive ack. activity was already
                    // refreshed by the read itself
                    Flow::Continue
                } else {
                    self.deliver(frame)
                }
            }
            FrameType::Text | FrameType::Binary => {
                let frame = {
                    let mut extensions = self.extensions.lock().unwrap();

                    apply_pipeline(&mut extensions, frame, |ext, f| ext.process_incoming(f))
                };

                match frame {
                    Ok(frame) => self.deliver(frame),
                    Err(e) => {
                        self.fault(
                            CloseReason::new(codes::PROTOCOL_ERROR, "extension fault"),
                            SessionError::Extension(e),
                        );

                        Flow::Stop
                    }
                }
            }
        }
    }

    fn deliver(&mut self, frame: Frame) -> Flow {
        if !self.delivering {
            return Flow::Continue;
        }

        match self.incoming.send(frame) {
            Ok(()) => Flow::Continue,
            Err(SendError::Overflow(_)) => {
                if self.config.overflow_closes_session {
                    if !self.shared.is_cancelled() {
                        self.shared.close_reason.set(Err(SessionError::Overflow));

                        let _ = self.control.send(Frame::close(Some(CloseReason::new(
                            codes::TRY_AGAIN_LATER,
                            "receive queue overflow",
                        ))));
                    }

                    Flow::Stop
                } else {
                    // only the incoming direction dies. keep reading so
                    // control frames still work
                    debug!("incoming channel overflowed, dropping further data frames");
                    self.delivering = false;

                    Flow::Continue
                }
            }
            Err(SendError::Disconnected(_)) => {
                // the application stopped listening
                self.delivering = false;

                Flow::Continue
            }
            Err(SendError::Cancelled(_)) => Flow::Stop,
        }
    }

    // a protocol-level fault. resolve the close reason, fail the incoming
    // side, and ask the writer to say goodbye with the right close code
    fn fault(&mut self, close: CloseReason, e: SessionError) {
        if self.shared.is_cancelled() {
            return;
        }

        debug!("session fault: {}", e);

        self.shared.close_reason.set(Err(e));
        self.incoming.close_faulted();

        let _ = self.control.send(Frame::close(Some(close)));
    }

    // EOF without a close handshake
    fn peer_gone(&mut self) {
        if self.shared.is_cancelled() {
            return;
        }

        let close_received = self.shared.flags.lock().unwrap().close_received;

        if !close_received {
            self.shared
                .close_reason
                .set(Err(SessionError::Io(io::ErrorKind::UnexpectedEof)));
        }

        self.incoming.close_faulted();
        self.control.cancel();
    }
}

struct WriterTask<W: Write> {
    stream: W,
    wchan: channel::Receiver<Frame>,
    extensions: Arc<Mutex<Vec<Box<dyn Extension>>>>,
    shared: Arc<Shared>,
    config: SessionConfig,
    role: Role,
    last_ping: Instant,
    mid_message: bool,
}

impl<W: Write> WriterTask<W> {
    fn mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(gen_mask()),
            Role::Server => None,
        }
    }

    fn wait_duration(&self) -> Duration {
        let interval = match self.config.ping_interval {
            Some(interval) => interval,
            None => return Duration::from_secs(3600),
        };

        let now = Instant::now();
        let last_activity = *self.shared.last_activity.lock().unwrap();

        let next_ping = self.last_ping + interval;
        let expiry = last_activity + self.config.timeout;

        let deadline = if next_ping < expiry { next_ping } else { expiry };

        if deadline > now {
            deadline - now
        } else {
            Duration::from_millis(1)
        }
    }

    fn write_wire(
        &mut self,
        opcode: u8,
        fin: bool,
        rsv: RsvBits,
        mut data: Vec<u8>,
    ) -> Result<(), io::Error> {
        if log_enabled!(log::Level::Trace) {
            trace!(
                "OUT ws opcode={} fin={} {}",
                opcode,
                fin,
                PayloadDisplay(&data)
            );
        }

        let mask = self.mask();
        write_frame(&mut self.stream, opcode, fin, rsv, &mut data, mask)?;
        self.stream.flush()?;

        Ok(())
    }

    fn write_close(&mut self, reason: &CloseReason) -> Result<(), io::Error> {
        self.write_wire(OPCODE_CLOSE, true, RsvBits::none(), reason.to_payload())
    }

    fn io_fault(&mut self, e: io::Error) {
        if self.shared.is_cancelled() {
            return;
        }

        debug!("session write failed: {}", e);

        self.shared
            .close_reason
            .set(Err(SessionError::Io(e.kind())));

        self.wchan.cancel();
        (self.shared.shutdown)();
    }

    fn run(mut self) {
        loop {
            match self.wchan.recv_timeout(self.wait_duration()) {
                Ok(frame) => {
                    let frame = if frame.is_control() {
                        frame
                    } else {
                        let processed = {
                            let mut extensions = self.extensions.lock().unwrap();

                            apply_pipeline(&mut extensions, frame, |ext, f| {
                                ext.process_outgoing(f)
                            })
                        };

                        match processed {
                            Ok(frame) => frame,
                            Err(e) => {
                                if !self.shared.is_cancelled() {
                                    self.shared
                                        .close_reason
                                        .set(Err(SessionError::Extension(e)));
                                }

                                self.wchan.cancel();
                                (self.shared.shutdown)();
                                break;
                            }
                        }
                    };

                    let is_close = frame.frame_type == FrameType::Close;

                    let opcode = if !frame.is_control() && self.mid_message {
                        OPCODE_CONTINUATION
                    } else {
                        frame.frame_type.opcode()
                    };

                    if !frame.is_control() {
                        self.mid_message = !frame.fin;
                    }

                    if let Err(e) = self.write_wire(opcode, frame.fin, frame.rsv, frame.data) {
                        self.io_fault(e);
                        break;
                    }

                    if is_close {
                        self.shared.set_close_sent();

                        // no application payload after the close handshake
                        // begins
                        self.wchan.close();

                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let interval = match self.config.ping_interval {
                        Some(interval) => interval,
                        None => continue,
                    };

                    let now = Instant::now();
                    let last_activity = *self.shared.last_activity.lock().unwrap();

                    if now.duration_since(last_activity) >= self.config.timeout {
                        debug!("session keep-alive expired");

                        if !self.shared.is_cancelled() {
                            self.shared.close_reason.set(Err(SessionError::TimedOut));

                            let reason =
                                CloseReason::new(codes::INTERNAL_ERROR, "keep-alive timeout");
                            let _ = self.write_close(&reason);

                            self.shared.set_close_sent();
                        }

                        self.wchan.cancel();
                        (self.shared.shutdown)();

                        break;
                    }

                    if now.duration_since(self.last_ping) >= interval {
                        if let Err(e) = self.write_wire(
                            OPCODE_PING,
                            true,
                            RsvBits::none(),
                            Vec::new(),
                        ) {
                            self.io_fault(e);
                            break;
                        }

                        self.last_ping = now;
                    }
                }
                Err(RecvTimeoutError::Recv(RecvError::Closed)) => {
                    // all senders gone without an explicit close frame
                    let close_sent = self.shared.flags.lock().unwrap().close_sent;

                    if !close_sent {
                        let reason = CloseReason::new(codes::NORMAL, "");
                        let _ = self.write_close(&reason);

                        self.shared.set_close_sent();
                    }

                    break;
                }
                Err(RecvTimeoutError::Recv(RecvError::Overflow)) => {
                    if self.config.overflow_closes_session {
                        if !self.shared.is_cancelled() {
                            self.shared.close_reason.set(Err(SessionError::Overflow));

                            let reason =
                                CloseReason::new(codes::TRY_AGAIN_LATER, "send queue overflow");
                            let _ = self.write_close(&reason);

                            self.shared.set_close_sent();
                        }

                        (self.shared.shutdown)();
                    }

                    // either way the outgoing direction is finished
                    break;
                }
                Err(RecvTimeoutError::Recv(RecvError::Cancelled))
                | Err(RecvTimeoutError::Recv(RecvError::Faulted)) => break,
            }
        }

        let mut flags = self.shared.flags.lock().unwrap();
        flags.writer_done = true;
    }
}

// one established websocket session over a split duplex stream. the
// reader and writer run as their own threads and terminate when the
// close handshake completes, the keep-alive expires, the transport is
// severed, or the session is cancelled
pub struct Session {
    outgoing: channel::Sender<Frame>,
    incoming: channel::Receiver<Frame>,
    shared: Arc<Shared>,
    reader_thread: Option<thread::JoinHandle<()>>,
    writer_thread: Option<thread::JoinHandle<()>>,
}

impl Session {
    pub fn start<R, W, F>(
        reader: R,
        writer: W,
        shutdown: F,
        role: Role,
        extensions: Vec<Box<dyn Extension>>,
        config: SessionConfig,
        pool: &Arc<BufferPool>,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        assert!(pool.block_size() >= config.max_frame_size + HEADER_SIZE_MAX);

        let allowed_rsv = active_rsv_bits(&extensions);
        let extensions = Arc::new(Mutex::new(extensions));

        let shared = Arc::new(Shared {
            flags: Mutex::new(Flags::default()),
            close_reason: Deferred::new(),
            last_activity: Mutex::new(Instant::now()),
            cancelled: AtomicBool::new(false),
            shutdown: Box::new(shutdown),
        });

        let (incoming_s, incoming_r) =
            channel::channel(config.incoming_capacity, config.incoming_policy);
        let (outgoing_s, outgoing_r) =
            channel::channel(config.outgoing_capacity, config.outgoing_policy);

        let reader_task = ReaderTask {
            stream: reader,
            ring: RingBuffer::new(pool.checkout()),
            decoder: FrameDecoder::new(config.max_frame_size, allowed_rsv),
            assembler: MessageAssembler::new(config.max_frame_size),
            incoming: incoming_s,
            control: outgoing_s.clone(),
            extensions: Arc::clone(&extensions),
            shared: Arc::clone(&shared),
            config: config.clone(),
            delivering: true,
        };

        let writer_task = WriterTask {
            stream: writer,
            wchan: outgoing_r,
            extensions,
            shared: Arc::clone(&shared),
            config,
            role,
            last_ping: Instant::now(),
            mid_message: false,
        };

        let reader_thread = thread::spawn(move || reader_task.run());
        let writer_thread = thread::spawn(move || writer_task.run());

        Self {
            outgoing: outgoing_s,
            incoming: incoming_r,
            shared,
            reader_thread: Some(reader_thread),
            writer_thread: Some(writer_thread),
        }
    }

    pub fn start_tcp(
        stream: TcpStream,
        role: Role,
        extensions: Vec<Box<dyn Extension>>,
        config: SessionConfig,
        pool: &Arc<BufferPool>,
    ) -> Result<Self, io::Error> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let shutdown = move || {
            let _ = stream.shutdown(Shutdown::Both);
        };

        Ok(Self::start(
            reader, writer, shutdown, role, extensions, config, pool,
        ))
    }

    pub fn send(&self, frame: Frame) -> Result<(), SendError<Frame>> {
        self.outgoing.send(frame)
    }

    pub fn recv(&self) -> Result<Frame, RecvError> {
        self.incoming.recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Frame, RecvTimeoutError> {
        self.incoming.recv_timeout(timeout)
    }

    // begin the close handshake
    pub fn close(&self, reason: Option<CloseReason>) -> Result<(), SendError<Frame>> {
        self.outgoing.send(Frame::close(reason))
    }

    pub fn state(&self) -> SessionState {
        let flags = self.shared.flags.lock().unwrap();

        if flags.reader_done && flags.writer_done {
            SessionState::Closed
        } else if flags.close_sent
            || flags.close_received
            || self.shared.is_cancelled()
            || self.shared.close_reason.is_set()
        {
            SessionState::Closing
        } else {
            SessionState::Open
        }
    }

    // blocks until the close handshake (or fault) resolves
    pub fn wait_close_reason(&self) -> CloseOutcome {
        self.shared.close_reason.wait()
    }

    pub fn close_reason_timeout(&self, timeout: Duration) -> Option<CloseOutcome> {
        self.shared.close_reason.wait_timeout(timeout)
    }

    // tear the session down: unblock every suspended operation, resolve
    // the close reason with the cancellation, sever the transport
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.close_reason.set(Err(SessionError::Cancelled));

        self.outgoing.cancel();
        self.incoming.cancel();

        (self.shared.shutdown)();
    }

    // wait for the reader and writer to finish
    pub fn join(&mut self) {
        if let Some(thread) = self.reader_thread.take() {
            let _ = thread.join();
        }

        if let Some(thread) = self.writer_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let done = {
            let flags = self.shared.flags.lock().unwrap();

            flags.reader_done && flags.writer_done
        };

        if !done {
            self.cancel();
        }

        self.join();
    }
}

pub mod testutil {
    use super::*;
    use std::sync::mpsc;

    enum PipeMsg {
        Data(Vec<u8>),
        Eof,
    }

    pub struct PipeReader {
        rx: mpsc::Receiver<PipeMsg>,
        current: Option<(Vec<u8>, usize)>,
        eof: bool,
    }

    impl Read for PipeReader {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
            loop {
                if self.eof {
                    return Ok(0);
                }

                if let Some((data, mut pos)) = self.current.take() {
                    let size = std::cmp::min(buf.len(), data.len() - pos);

                    buf[..size].copy_from_slice(&data[pos..(pos + size)]);
                    pos += size;

                    if pos < data.len() {
                        self.current = Some((data, pos));
                    }

                    return Ok(size);
                }

                match self.rx.recv() {
                    Ok(PipeMsg::Data(data)) if !data.is_empty() => {
                        self.current = Some((data, 0));
                    }
                    Ok(PipeMsg::Data(_)) => {}
                    Ok(PipeMsg::Eof) | Err(_) => {
                        self.eof = true;
                    }
                }
            }
        }
    }

    pub struct PipeWriter {
        tx: Mutex<mpsc::Sender<PipeMsg>>,
        closed: Arc<AtomicBool>,
    }

    impl Write for PipeWriter {
        fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }

            self.tx
                .lock()
                .unwrap()
                .send(PipeMsg::Data(buf.to_vec()))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), io::Error> {
            Ok(())
        }
    }

    // the far end of an in-memory duplex transport, driven by tests as
    // the remote peer
    pub struct TestPeer {
        to_session: mpsc::Sender<PipeMsg>,
        from_session: PipeReader,
        wire: Vec<u8>,
        decoder: FrameDecoder,
    }

    impl TestPeer {
        pub fn send_bytes(&self, data: &[u8]) {
            self.to_session
                .send(PipeMsg::Data(data.to_vec()))
                .unwrap();
        }

        pub fn send_frame(&self, opcode: u8, fin: bool, rsv: RsvBits, data: &[u8]) {
            let wire = websocket::testutil::encode_frame(opcode, fin, rsv, data, None);

            self.send_bytes(&wire);
        }

        pub fn eof(&self) {
            let _ = self.to_session.send(PipeMsg::Eof);
        }

        // blocks until a whole frame arrives from the session
        pub fn read_frame(&mut self) -> WireFrame {
            loop {
                let (frame, pos) = {
                    let mut rbuf = io::Cursor::new(&mut self.wire[..]);

                    let frame = self.decoder.decode(&mut rbuf).unwrap();

                    (frame, rbuf.position() as usize)
                };

                self.wire.drain(..pos);

                if let Some(frame) = frame {
                    return frame;
                }

                let mut buf = [0; 4096];
                let size = self.from_session.read(&mut buf).unwrap();

                if size == 0 {
                    panic!("session closed the transport before a frame arrived");
                }

                self.wire.extend(&buf[..size]);
            }
        }

        // skip frames until a close arrives, returning its reason
        pub fn read_close(&mut self) -> Option<CloseReason> {
            loop {
                let frame = self.read_frame();

                if frame.opcode == OPCODE_CLOSE {
                    return CloseReason::parse(&frame.data).unwrap();
                }
            }
        }
    }

    pub fn session_pair(
        role: Role,
        extensions: Vec<Box<dyn Extension>>,
        config: SessionConfig,
    ) -> (Session, TestPeer) {
        let (to_sess_tx, to_sess_rx) = mpsc::channel();
        let (from_sess_tx, from_sess_rx) = mpsc::channel();

        let closed = Arc::new(AtomicBool::new(false));

        let reader = PipeReader {
            rx: to_sess_rx,
            current: None,
            eof: false,
        };

        let writer = PipeWriter {
            tx: Mutex::new(from_sess_tx),
            closed: Arc::clone(&closed),
        };

        let shutdown = {
            let tx = Mutex::new(to_sess_tx.clone());

            move || {
                let _ = tx.lock().unwrap().send(PipeMsg::Eof);
                closed.store(true, Ordering::SeqCst);
            }
        };

        let pool = BufferPool::new(config.max_frame_size + HEADER_SIZE_MAX, 1);

        let session = Session::start(reader, writer, shutdown, role, extensions, config, &pool);

        let peer = TestPeer {
            to_session: to_sess_tx,
            from_session: PipeReader {
                rx: from_sess_rx,
                current: None,
                eof: false,
            },
            wire: Vec::new(),
            decoder: FrameDecoder::new(
                1 << 24,
                RsvBits {
                    rsv1: true,
                    rsv2: true,
                    rsv3: true,
                },
            ),
        };

        (session, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::extension::{ExtensionRegistry, PerMessageDeflate};
    use crate::http1::ExtensionOffer;
    use crate::websocket::{OPCODE_BINARY, OPCODE_PONG, OPCODE_TEXT};

    fn small_config() -> SessionConfig {
        SessionConfig {
            max_frame_size: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_send_and_receive() {
        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), small_config());

        peer.send_frame(OPCODE_TEXT, true, RsvBits::none(), b"hello");

        let frame = session.recv().unwrap();
        assert_eq!(frame.frame_type, FrameType::Text);
        assert_eq!(frame.data, b"hello");

        session.send(Frame::text("world")).unwrap();

        let frame = peer.read_frame();
        assert_eq!(frame.opcode, OPCODE_TEXT);
        assert_eq!(frame.data, b"world");

        assert_eq!(session.state(), SessionState::Open);

        session.cancel();
        session.join();
    }

    #[test]
    fn test_outgoing_order() {
        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), small_config());

        for i in 0..50u32 {
            session
                .send(Frame::binary(i.to_be_bytes().to_vec()))
                .unwrap();
        }

        for i in 0..50u32 {
            let frame = peer.read_frame();
            assert_eq!(frame.opcode, OPCODE_BINARY);
            assert_eq!(frame.data, i.to_be_bytes());
        }

        session.cancel();
        session.join();
    }

    #[test]
    fn test_masked_client_frames() {
        let (mut session, mut peer) = session_pair(Role::Client, Vec::new(), small_config());

        session.send(Frame::text("masked")).unwrap();

        // the test decoder unmasks transparently; check the raw bit too
        let frame = peer.read_frame();
        assert_eq!(frame.data, b"masked");

        session.cancel();
        session.join();
    }

    #[test]
    fn test_auto_pong() {
        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), small_config());

        peer.send_frame(OPCODE_PING, true, RsvBits::none(), b"abc");

        let frame = peer.read_frame();
        assert_eq!(frame.opcode, OPCODE_PONG);
        assert_eq!(frame.data, b"abc");

        // the ping is also delivered to the application
        let frame = session.recv().unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);
        assert_eq!(frame.data, b"abc");

        session.cancel();
        session.join();
    }

    #[test]
    fn test_raw_no_auto_pong() {
        let config = SessionConfig {
            auto_pong: false,
            ..small_config()
        };

        let (mut session, peer) = session_pair(Role::Server, Vec::new(), config);

        peer.send_frame(OPCODE_PING, true, RsvBits::none(), b"abc");

        let frame = session.recv().unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping);

        // no pong was generated; the next thing the session writes is
        // what the application sends
        session.send(Frame::text("only")).unwrap();

        let mut peer = peer;
        let frame = peer.read_frame();
        assert_eq!(frame.opcode, OPCODE_TEXT);

        session.cancel();
        session.join();
    }

    #[test]
    fn test_fragment_reassembly() {
        let (mut session, peer) = session_pair(Role::Server, Vec::new(), small_config());

        peer.send_frame(OPCODE_TEXT, false, RsvBits::none(), b"Hello");
        peer.send_frame(OPCODE_CONTINUATION, false, RsvBits::none(), b"");
        peer.send_frame(OPCODE_CONTINUATION, false, RsvBits::none(), b"12");
        peer.send_frame(OPCODE_CONTINUATION, true, RsvBits::none(), b"3");

        let frame = session.recv().unwrap();
        assert_eq!(frame.frame_type, FrameType::Text);
        assert_eq!(frame.fin, true);
        assert_eq!(frame.data, b"Hello123");

        session.cancel();
        session.join();
    }

    #[test]
    fn test_peer_close_handshake() {
        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), small_config());

        let reason = CloseReason::new(codes::NORMAL, "bye");
        peer.send_frame(OPCODE_CLOSE, true, RsvBits::none(), &reason.to_payload());

        // the close is echoed back
        let echoed = peer.read_close().unwrap();
        assert_eq!(echoed.code, codes::NORMAL);
        assert_eq!(echoed.message, "bye");

        assert_eq!(session.wait_close_reason(), Ok(Some(reason)));

        // the incoming side is finished
        assert_eq!(session.recv(), Err(RecvError::Closed));

        session.join();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_local_close_handshake() {
        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), small_config());

        session
            .close(Some(CloseReason::new(codes::GOING_AWAY, "moving")))
            .unwrap();

        let got = peer.read_close().unwrap();
        assert_eq!(got.code, codes::GOING_AWAY);

        // no further sends once the close handshake has begun
        let mut refused = false;
        for _ in 0..100 {
            if session.send(Frame::text("late")).is_err() {
                refused = true;
                break;
            }

            thread::sleep(Duration::from_millis(10));
        }
        assert!(refused);

        // peer acknowledges
        peer.send_frame(OPCODE_CLOSE, true, RsvBits::none(), &got.to_payload());

        assert!(session.wait_close_reason().is_ok());

        session.join();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_max_frame_size_enforced() {
        let config = SessionConfig {
            max_frame_size: 1023,
            ..Default::default()
        };

        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), config);

        peer.send_frame(OPCODE_BINARY, true, RsvBits::none(), &vec![0; 1024]);

        let close = peer.read_close().unwrap();
        assert_eq!(close.code, codes::TOO_BIG);

        // nothing was delivered to the application
        assert_eq!(session.recv(), Err(RecvError::Faulted));

        match session.wait_close_reason() {
            Err(SessionError::Protocol(websocket::Error::FrameTooBig { size, max })) => {
                assert_eq!(size, 1024);
                assert_eq!(max, 1023);
            }
            other => panic!("unexpected close outcome: {:?}", other),
        }

        session.join();
    }

    #[test]
    fn test_fragmented_control_frame_faults() {
        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), small_config());

        peer.send_frame(OPCODE_PING, false, RsvBits::none(), b"x");

        let close = peer.read_close().unwrap();
        assert_eq!(close.code, codes::PROTOCOL_ERROR);

        assert_eq!(session.recv(), Err(RecvError::Faulted));
        assert_eq!(
            session.wait_close_reason(),
            Err(SessionError::Protocol(
                websocket::Error::FragmentedControlFrame
            ))
        );

        session.join();
    }

    #[test_log::test]
    fn test_keep_alive_ping_and_timeout() {
        let config = SessionConfig {
            ping_interval: Some(Duration::from_millis(25)),
            timeout: Duration::from_millis(150),
            ..small_config()
        };

        let (mut session, mut peer) = session_pair(Role::Server, Vec::new(), config);

        // the session pings on its own
        let frame = peer.read_frame();
        assert_eq!(frame.opcode, OPCODE_PING);

        // with the peer silent, the keep-alive expires
        let close = peer.read_close().unwrap();
        assert_eq!(close.code, codes::INTERNAL_ERROR);

        assert_eq!(session.wait_close_reason(), Err(SessionError::TimedOut));

        session.join();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_cancel_liveness() {
        let (session, _peer) = session_pair(Role::Server, Vec::new(), small_config());

        let session = session;

        thread::scope(|s| {
            let h = s.spawn(|| session.recv());

            thread::sleep(Duration::from_millis(20));

            session.cancel();

            assert_eq!(h.join().unwrap(), Err(RecvError::Cancelled));
        });

        assert_eq!(
            session.wait_close_reason(),
            Err(SessionError::Cancelled)
        );

        let mut session = session;
        session.join();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_peer_disappears() {
        let (mut session, peer) = session_pair(Role::Server, Vec::new(), small_config());

        peer.eof();

        assert_eq!(
            session.wait_close_reason(),
            Err(SessionError::Io(io::ErrorKind::UnexpectedEof))
        );
        assert_eq!(session.recv(), Err(RecvError::Faulted));

        session.join();
    }

    #[test]
    fn test_deflate_end_to_end() {
        let mut registry = ExtensionRegistry::new();
        registry.install(Box::new(PerMessageDeflate::new())).unwrap();

        let offers = vec![ExtensionOffer {
            name: "permessage-deflate".to_owned(),
            params: Vec::new(),
        }];

        let (server_exts, header) = registry.negotiate_server(&offers);
        assert!(header.is_some());

        let (mut session, mut peer) = session_pair(Role::Server, server_exts, small_config());

        // outgoing frames are compressed with rsv1 set
        session
            .send(Frame::text("compress me, compress me, compress me"))
            .unwrap();

        let frame = peer.read_frame();
        assert!(frame.rsv.rsv1);
        assert_ne!(frame.data, b"compress me, compress me, compress me");

        // echo the compressed bytes back; the session inflates them
        peer.send_frame(OPCODE_TEXT, true, frame.rsv, &frame.data);

        let got = session.recv().unwrap();
        assert_eq!(got.data, b"compress me, compress me, compress me");
        assert!(!got.rsv.rsv1);

        session.cancel();
        session.join();
    }
}
