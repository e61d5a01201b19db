use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::{DecodeOutcome, FrameDecoder, MAX_MESSAGE_SIZE, Message};

use super::stats::StatsCounters;
use super::{
    ErrorQueue, NetworkStats, POLL_INTERVAL, ReceiveHandler, SocketTransport, TransportError, lock,
};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Outbound {
    buffer: Vec<u8>,
    messages: u64,
    flush_requested: bool,
}

struct Shared {
    peer_addr: SocketAddr,
    disposed: AtomicBool,
    outbound: Mutex<Outbound>,
    wake: Condvar,
    errors: ErrorQueue,
    stats: StatsCounters,
}

/// Reliable, ordered transport over one TCP connection.
pub struct StreamTransport {
    shared: Arc<Shared>,
    stream: TcpStream,
    local_addr: SocketAddr,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new(stream: TcpStream, handler: ReceiveHandler) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let shared = Arc::new(Shared {
            peer_addr,
            disposed: AtomicBool::new(false),
            outbound: Mutex::new(Outbound::default()),
            wake: Condvar::new(),
            errors: ErrorQueue::new(),
            stats: StatsCounters::default(),
        });

        let send_shared = Arc::clone(&shared);
        let send_thread = thread::Builder::new()
            .name(format!("stream-send {peer_addr}"))
            .spawn(move || send_loop(send_shared, writer))?;

        let receive_shared = Arc::clone(&shared);
        let receive_thread = thread::Builder::new()
            .name(format!("stream-recv {peer_addr}"))
            .spawn(move || receive_loop(receive_shared, reader, handler))?;

        log::debug!("Stream transport {} <-> {} started", local_addr, peer_addr);

        Ok(Self {
            shared,
            stream,
            local_addr,
            send_thread: Mutex::new(Some(send_thread)),
            receive_thread: Mutex::new(Some(receive_thread)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }
}

impl SocketTransport for StreamTransport {
    fn send(&self, message: &Message, _destination: Option<SocketAddr>) -> Result<(), TransportError> {
        let mut outbound = lock(&self.shared.outbound);
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        message.encode_into(&mut outbound.buffer)?;
        outbound.messages += 1;
        Ok(())
    }

    fn flush(&self) {
        let mut outbound = lock(&self.shared.outbound);
        if outbound.buffer.is_empty() {
            return;
        }
        outbound.flush_requested = true;
        self.shared.wake.notify_one();
    }

    fn dispose(&self) {
        {
            let mut outbound = lock(&self.shared.outbound);
            if self.shared.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            outbound.flush_requested = true;
        }
        self.shared.wake.notify_all();

        // The send thread drains the last batch before the socket goes away.
        join_unless_current(&self.send_thread);
        let _ = self.stream.shutdown(Shutdown::Both);
        join_unless_current(&self.receive_thread);

        log::debug!("Stream transport to {} disposed", self.shared.peer_addr);
    }

    fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    fn errors(&self) -> &ErrorQueue {
        &self.shared.errors
    }

    fn stats(&self) -> NetworkStats {
        self.shared.stats.snapshot()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub(crate) fn join_unless_current(slot: &Mutex<Option<JoinHandle<()>>>) {
    let Some(handle) = lock(slot).take() else {
        return;
    };
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log::error!("Transport thread panicked");
    }
}

fn send_loop(shared: Arc<Shared>, mut writer: TcpStream) {
    loop {
        let (batch, messages, disposed) = {
            let mut outbound = lock(&shared.outbound);
            while !outbound.flush_requested && !shared.disposed.load(Ordering::Acquire) {
                outbound = match shared.wake.wait_timeout(outbound, POLL_INTERVAL) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            outbound.flush_requested = false;
            let messages = std::mem::take(&mut outbound.messages);
            (
                std::mem::take(&mut outbound.buffer),
                messages,
                shared.disposed.load(Ordering::Acquire),
            )
        };

        if !batch.is_empty() {
            match writer.write_all(&batch) {
                Ok(()) => shared.stats.record_sent(messages, batch.len()),
                Err(e) => {
                    if !disposed {
                        shared
                            .errors
                            .push(format!("send to {} failed: {}", shared.peer_addr, e));
                    }
                    return;
                }
            }
        }

        if disposed {
            let _ = writer.flush();
            return;
        }
    }
}

fn receive_loop(shared: Arc<Shared>, mut reader: TcpStream, handler: ReceiveHandler) {
    let peer = shared.peer_addr;
    let mut decoder = FrameDecoder::default();
    let mut chunk = vec![0u8; MAX_MESSAGE_SIZE];

    while !shared.disposed.load(Ordering::Acquire) {
        let needed = match decoder.bytes_needed() {
            Ok(needed) => needed,
            Err(e) => {
                fail(&shared, format!("invalid frame from {}: {}", peer, e));
                return;
            }
        };

        if needed == 0 {
            match decoder.next_message() {
                Ok(DecodeOutcome::Message(message)) => {
                    shared.stats.record_received(1, 0);
                    if shared.disposed.load(Ordering::Acquire) {
                        return;
                    }
                    handler(message, peer);
                }
                Ok(DecodeOutcome::NeedMore(_)) => {}
                Err(e) => {
                    fail(&shared, format!("invalid frame from {}: {}", peer, e));
                    return;
                }
            }
            continue;
        }

        // Read no further than the current frame: header first, then body.
        match reader.read(&mut chunk[..needed]) {
            Ok(0) => {
                fail(&shared, format!("connection closed by {}", peer));
                return;
            }
            Ok(n) => {
                shared.stats.record_received(0, n);
                if let Err(e) = decoder.feed(&chunk[..n]) {
                    fail(&shared, format!("invalid frame from {}: {}", peer, e));
                    return;
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                fail(&shared, format!("receive from {} failed: {}", peer, e));
                return;
            }
        }
    }
}

fn fail(shared: &Shared, error: String) {
    if !shared.disposed.load(Ordering::Acquire) {
        shared.errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, PlayerSettings};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Instant;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn settings(name: &str) -> Message {
        Message::PlayerSettings(PlayerSettings {
            name: name.to_string(),
            data: vec![1, 2, 3],
        })
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let (a, b) = pair();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let sender = StreamTransport::new(a, Arc::new(|_, _| {})).unwrap();
        let _receiver = StreamTransport::new(
            b,
            Arc::new(move |message, _| {
                let _ = lock(&tx).send(message);
            }),
        )
        .unwrap();

        for i in 0..20 {
            sender.send(&settings(&format!("p{i}")), None).unwrap();
        }
        sender.flush();

        for i in 0..20 {
            let message = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(message, settings(&format!("p{i}")));
        }
    }

    #[test]
    fn dispose_is_idempotent_and_rejects_sends() {
        let (a, _b) = pair();
        let transport = StreamTransport::new(a, Arc::new(|_, _| {})).unwrap();

        transport.dispose();
        transport.dispose();

        assert!(transport.is_disposed());
        assert!(matches!(
            transport.send(&settings("late"), None),
            Err(TransportError::Disposed)
        ));
    }

    #[test]
    fn dispose_drains_pending_batch() {
        let (a, b) = pair();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let sender = StreamTransport::new(a, Arc::new(|_, _| {})).unwrap();
        let _receiver = StreamTransport::new(
            b,
            Arc::new(move |message, _| {
                let _ = lock(&tx).send(message);
            }),
        )
        .unwrap();

        sender.send(&settings("last words"), None).unwrap();
        sender.dispose();

        let message = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(message, settings("last words"));
    }

    #[test]
    fn garbage_header_is_reported() {
        let (mut raw, b) = pair();
        let receiver = StreamTransport::new(b, Arc::new(|_, _| {})).unwrap();

        raw.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while receiver.errors().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let errors = receiver.errors().drain();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("invalid frame"));
    }
}
