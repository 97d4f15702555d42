//! Pluggable transport operations table (spec.md §4.9): a socket transport
//! and an ADB-mediated transport behind one `JdwpTransport` interface, both
//! built on the same select-loop-plus-self-pipe shutdown idiom as the
//! source's `JdwpSocket.cpp`/`JdwpAdb.cpp`.

use crate::util::error::JdwpError;
use delegate::delegate;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use super::packet::HANDSHAKE;

/// One full unit handed up to the caller: either the echoed handshake or
/// one framed packet's raw bytes (header included).
pub enum Incoming {
    Handshake,
    Packet(Vec<u8>),
}

/// The operations table spec.md §4.9 describes: `accept`, `establish`,
/// `closeConnection`, `shutdown`, `isConnected`, `awaitingHandshake`,
/// `processIncoming`, `sendRequest`. `free` has no counterpart here —
/// `Drop` plays that role.
pub trait JdwpTransport {
    fn accept(&mut self) -> io::Result<()>;
    fn establish(&mut self) -> io::Result<()>;
    fn close_connection(&mut self);
    fn shutdown(&mut self);
    fn is_connected(&self) -> bool;
    fn awaiting_handshake(&self) -> bool;
    /// Blocks (via `select`) until a handshake or a full packet is
    /// buffered, the wake pipe fires, or the peer disappears.
    fn process_incoming(&mut self) -> io::Result<Option<Incoming>>;
    fn send_request(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// `sendBufferedRequest`: writes several slices as one `write`/`writev`
    /// call so a packet cannot be interleaved with another thread's.
    fn send_buffered(&mut self, parts: &[&[u8]]) -> io::Result<()>;
}

fn make_self_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn select_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<RawFd>> {
    let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut read_set) };
    let mut maxfd = 0;
    for &fd in fds {
        unsafe { libc::FD_SET(fd, &mut read_set) };
        maxfd = maxfd.max(fd);
    }
    let mut tv;
    let tv_ptr = match timeout {
        Some(d) => {
            tv = libc::timeval { tv_sec: d.as_secs() as libc::time_t, tv_usec: d.subsec_micros() as libc::suseconds_t };
            &mut tv as *mut libc::timeval
        }
        None => std::ptr::null_mut(),
    };
    let rc = unsafe { libc::select(maxfd + 1, &mut read_set, std::ptr::null_mut(), std::ptr::null_mut(), tv_ptr) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    Ok(fds.iter().copied().filter(|&fd| unsafe { libc::FD_ISSET(fd, &read_set) }).collect())
}

fn set_nodelay(fd: RawFd) {
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t,
        );
    }
}

/// One unit `RecvBuffer` can pull off the front of its buffer: a valid
/// handshake, a malformed one (the peer sent 14 bytes that aren't the
/// literal `JDWP-Handshake`, spec.md §4.9/§8 scenario 5), or a full packet.
enum ReadyUnit {
    Handshake,
    InvalidHandshake,
    Packet(Vec<u8>),
}

/// A buffered unit of received bytes: either we are still collecting the
/// 14-byte handshake, or we have moved on to length-prefixed packets.
struct RecvBuffer {
    buf: Vec<u8>,
    handshake_seen: bool,
}

impl RecvBuffer {
    fn new() -> Self {
        RecvBuffer { buf: Vec::new(), handshake_seen: false }
    }

    /// Pulls one complete unit off the front of `buf`, if any is ready.
    fn take_ready(&mut self) -> Option<ReadyUnit> {
        if !self.handshake_seen {
            if self.buf.len() >= HANDSHAKE.len() {
                let candidate: Vec<u8> = self.buf.drain(..HANDSHAKE.len()).collect();
                if candidate == HANDSHAKE.as_slice() {
                    self.handshake_seen = true;
                    return Some(ReadyUnit::Handshake);
                }
                return Some(ReadyUnit::InvalidHandshake);
            }
            return None;
        }
        if self.buf.len() < super::packet::HEADER_LEN {
            return None;
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length < super::packet::HEADER_LEN || self.buf.len() < length {
            return None;
        }
        let packet: Vec<u8> = self.buf.drain(..length).collect();
        Some(ReadyUnit::Packet(packet))
    }
}

/// TCP socket transport: binds a scanned port range, accepts exactly one
/// client, and drains/closes any further connection attempts.
pub struct SocketTransport {
    listener: TcpListener,
    stream: Option<TcpStream>,
    write_lock: Mutex<()>,
    wake_read: RawFd,
    wake_write: RawFd,
    recv: RecvBuffer,
}

impl SocketTransport {
    /// Binds the first available port in `port_range` on localhost.
    pub fn bind(port_range: std::ops::RangeInclusive<u16>) -> io::Result<Self> {
        let mut last_err = None;
        for port in port_range {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            match TcpListener::bind(addr) {
                Ok(listener) => {
                    let (wake_read, wake_write) = make_self_pipe()?;
                    return Ok(SocketTransport {
                        listener,
                        stream: None,
                        write_lock: Mutex::new(()),
                        wake_read,
                        wake_write,
                        recv: RecvBuffer::new(),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no port in range")))
    }
}

impl JdwpTransport for SocketTransport {
    fn accept(&mut self) -> io::Result<()> {
        loop {
            let ready = select_readable(&[self.listener.as_raw_fd(), self.wake_read], None)?;
            if ready.contains(&self.wake_read) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "shutdown requested"));
            }
            if ready.contains(&self.listener.as_raw_fd()) {
                let (stream, _peer) = self.listener.accept()?;
                if self.stream.is_some() {
                    // Second client while one is already attached: drain and
                    // close immediately to avoid port churn.
                    drop(stream);
                    continue;
                }
                set_nodelay(stream.as_raw_fd());
                self.stream = Some(stream);
                self.recv = RecvBuffer::new();
                return Ok(());
            }
        }
    }

    fn establish(&mut self) -> io::Result<()> {
        // Server mode: the connection is already live once `accept` returns.
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "no client accepted yet"))
        }
    }

    fn close_connection(&mut self) {
        self.stream = None;
        self.recv = RecvBuffer::new();
    }

    fn shutdown(&mut self) {
        let _ = unsafe { libc::write(self.wake_write, [0u8].as_ptr() as *const libc::c_void, 1) };
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn awaiting_handshake(&self) -> bool {
        self.stream.is_some() && !self.recv.handshake_seen
    }

    fn process_incoming(&mut self) -> io::Result<Option<Incoming>> {
        if let Some(ready) = self.recv.take_ready() {
            return self.resolve_ready(ready);
        }
        let stream = match &self.stream {
            Some(s) => s,
            None => return Ok(None),
        };
        let fd = stream.as_raw_fd();
        let ready = select_readable(&[fd, self.wake_read], None)?;
        if ready.contains(&self.wake_read) {
            return Ok(None);
        }
        if ready.contains(&fd) {
            let mut chunk = [0u8; 4096];
            let n = stream.try_clone()?.read(&mut chunk)?;
            if n == 0 {
                self.close_connection();
                return Ok(None);
            }
            self.recv.buf.extend_from_slice(&chunk[..n]);
        }
        match self.recv.take_ready() {
            Some(ready) => self.resolve_ready(ready),
            None => Ok(None),
        }
    }

    fn send_request(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.send_buffered(&[bytes])
    }

    fn send_buffered(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let stream = self.stream.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client"))?;
        let mut combined = Vec::new();
        for part in parts {
            combined.extend_from_slice(part);
        }
        stream.write_all(&combined)
    }
}

impl SocketTransport {
    /// A malformed handshake closes the connection (spec.md §8 scenario
    /// 5); everything else surfaces as-is.
    fn resolve_ready(&mut self, ready: ReadyUnit) -> io::Result<Option<Incoming>> {
        match ready {
            ReadyUnit::Handshake => Ok(Some(Incoming::Handshake)),
            ReadyUnit::Packet(bytes) => Ok(Some(Incoming::Packet(bytes))),
            ReadyUnit::InvalidHandshake => {
                self.close_connection();
                Ok(None)
            }
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// ADB-mediated transport: connects to a daemon-controlled unix socket,
/// advertises the process id, and receives the actual debugger file
/// descriptor via `SCM_RIGHTS`.
pub struct AdbTransport {
    control_path: String,
    pid: u32,
    stream: Option<TcpStream>,
    write_lock: Mutex<()>,
    wake_read: RawFd,
    wake_write: RawFd,
    recv: RecvBuffer,
}

impl AdbTransport {
    pub fn new(control_path: impl Into<String>, pid: u32) -> io::Result<Self> {
        let (wake_read, wake_write) = make_self_pipe()?;
        Ok(AdbTransport {
            control_path: control_path.into(),
            pid,
            stream: None,
            write_lock: Mutex::new(()),
            wake_read,
            wake_write,
            recv: RecvBuffer::new(),
        })
    }

    /// Connects to the control socket, retrying with exponential backoff
    /// from 500ms up to 2s, then advertises the pid as 4 hex chars and
    /// waits for the debugger fd over `SCM_RIGHTS`.
    fn connect_control_and_receive_fd(&self) -> io::Result<RawFd> {
        let mut backoff = Duration::from_millis(500);
        let control_fd = loop {
            match unix_connect(&self.control_path) {
                Ok(fd) => break fd,
                Err(e) => {
                    if backoff >= Duration::from_secs(2) {
                        return Err(e);
                    }
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
            }
        };
        let advert = format!("{:04x}", self.pid & 0xFFFF);
        let write_rc = unsafe { libc::write(control_fd, advert.as_ptr() as *const libc::c_void, advert.len()) };
        if write_rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(control_fd) };
            return Err(err);
        }
        let fd = recv_fd_with_scm_rights(control_fd)?;
        unsafe { libc::close(control_fd) };
        Ok(fd)
    }
}

fn unix_connect(path: &str) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "control socket path too long"));
    }
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }
    let rc = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Receives one file descriptor passed over `control_fd`'s ancillary data.
fn recv_fd_with_scm_rights(control_fd: RawFd) -> io::Result<RawFd> {
    let mut data_buf = [0u8; 1];
    let mut iov = libc::iovec { iov_base: data_buf.as_mut_ptr() as *mut libc::c_void, iov_len: data_buf.len() };
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(control_fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "no ancillary data with debugger fd"));
    }
    let data = unsafe { libc::CMSG_DATA(cmsg) } as *const libc::c_int;
    let fd = unsafe { data.read_unaligned() };
    Ok(fd)
}

impl JdwpTransport for AdbTransport {
    fn accept(&mut self) -> io::Result<()> {
        let fd = self.connect_control_and_receive_fd()?;
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        set_nodelay(stream.as_raw_fd());
        self.stream = Some(stream);
        self.recv = RecvBuffer::new();
        Ok(())
    }

    fn establish(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "no debugger fd received yet"))
        }
    }

    fn close_connection(&mut self) {
        self.stream = None;
        self.recv = RecvBuffer::new();
    }

    fn shutdown(&mut self) {
        let _ = unsafe { libc::write(self.wake_write, [0u8].as_ptr() as *const libc::c_void, 1) };
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn awaiting_handshake(&self) -> bool {
        self.stream.is_some() && !self.recv.handshake_seen
    }

    fn process_incoming(&mut self) -> io::Result<Option<Incoming>> {
        if let Some(ready) = self.recv.take_ready() {
            return self.resolve_ready(ready);
        }
        let stream = match &self.stream {
            Some(s) => s,
            None => return Ok(None),
        };
        let fd = stream.as_raw_fd();
        let ready = select_readable(&[fd, self.wake_read], None)?;
        if ready.contains(&self.wake_read) {
            return Ok(None);
        }
        if ready.contains(&fd) {
            let mut chunk = [0u8; 4096];
            let n = stream.try_clone()?.read(&mut chunk)?;
            if n == 0 {
                self.close_connection();
                return Ok(None);
            }
            self.recv.buf.extend_from_slice(&chunk[..n]);
        }
        match self.recv.take_ready() {
            Some(ready) => self.resolve_ready(ready),
            None => Ok(None),
        }
    }

    fn send_request(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.send_buffered(&[bytes])
    }

    fn send_buffered(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let stream = self.stream.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no debugger fd"))?;
        let mut combined = Vec::new();
        for part in parts {
            combined.extend_from_slice(part);
        }
        stream.write_all(&combined)
    }
}

impl AdbTransport {
    fn resolve_ready(&mut self, ready: ReadyUnit) -> io::Result<Option<Incoming>> {
        match ready {
            ReadyUnit::Handshake => Ok(Some(Incoming::Handshake)),
            ReadyUnit::Packet(bytes) => Ok(Some(Incoming::Packet(bytes))),
            ReadyUnit::InvalidHandshake => {
                self.close_connection();
                Ok(None)
            }
        }
    }
}

impl Drop for AdbTransport {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// The runtime-selected transport (`transport=dt_socket` vs. ADB-mediated),
/// forwarding the whole operations table to whichever variant is active.
pub enum Transport {
    Socket(SocketTransport),
    Adb(AdbTransport),
}

impl JdwpTransport for Transport {
    delegate! {
        to match self {
            Transport::Socket(t) => t,
            Transport::Adb(t) => t,
        } {
            fn accept(&mut self) -> io::Result<()>;
            fn establish(&mut self) -> io::Result<()>;
            fn close_connection(&mut self);
            fn shutdown(&mut self);
            fn is_connected(&self) -> bool;
            fn awaiting_handshake(&self) -> bool;
            fn process_incoming(&mut self) -> io::Result<Option<Incoming>>;
            fn send_request(&mut self, bytes: &[u8]) -> io::Result<()>;
            fn send_buffered(&mut self, parts: &[&[u8]]) -> io::Result<()>;
        }
    }
}

pub fn illegal_argument_if_not_connected(connected: bool) -> Result<(), JdwpError> {
    if connected {
        Ok(())
    } else {
        Err(JdwpError::IllegalArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_buffer_waits_for_full_handshake() {
        let mut rb = RecvBuffer::new();
        rb.buf.extend_from_slice(b"JDWP-Hand");
        assert!(rb.take_ready().is_none());
        rb.buf.extend_from_slice(b"shake");
        match rb.take_ready() {
            Some(ReadyUnit::Handshake) => {}
            _ => panic!("expected handshake"),
        }
        assert!(rb.handshake_seen);
    }

    #[test]
    fn recv_buffer_rejects_malformed_handshake() {
        let mut rb = RecvBuffer::new();
        rb.buf.extend_from_slice(b"XXXX-Handshake");
        match rb.take_ready() {
            Some(ReadyUnit::InvalidHandshake) => {}
            _ => panic!("expected invalid handshake"),
        }
        assert!(!rb.handshake_seen);
    }

    #[test]
    fn recv_buffer_waits_for_full_packet() {
        let mut rb = RecvBuffer::new();
        rb.handshake_seen = true;
        let packet = crate::jdwp::packet::Packet::Request { id: 1, cmd_set: 1, cmd: 1, data: vec![1, 2, 3] }.encode();
        rb.buf.extend_from_slice(&packet[..5]);
        assert!(rb.take_ready().is_none());
        rb.buf.extend_from_slice(&packet[5..]);
        match rb.take_ready() {
            Some(ReadyUnit::Packet(bytes)) => assert_eq!(bytes, packet),
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn socket_transport_binds_and_reports_disconnected() {
        let transport = SocketTransport::bind(40000..=40050).expect("bind in range");
        assert!(!transport.is_connected());
    }
}
