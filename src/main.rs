use std::cmp::min;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone, Utc};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::sendfile::sendfile;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket;
use nix::unistd::{chdir, close, read};

/// Capacity of the per-connection receive and send buffers.
const BUFFER_SIZE: usize = 8192;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LISTEN_BACKLOG: usize = 64;

/// Requested paths containing these markers are served from the matching
/// directory under the working directory; everything else is a 404.
const STATIC_PREFIX: &str = "/static/";
const DYNAMIC_PREFIX: &str = "/dynamic/";

/// Fixed server token advertised in every 200 response.
const SERVER_TOKEN: &str = "Apache/2.2.9";

/// Multiplexer token reserved for the listening socket.
const LISTENER_TOKEN: u64 = 0;

const MAX_HEADERS: usize = 32;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

fn usage(server: &Server, argv0: &str) {
    print!(
        "usage:\t{} [/path/to/wwwroot] [flags]\n\n\
        flags:\t--port number (default: {})\n\
        \t\tSpecifies which port to listen on for connections.\n\n\
        \t--addr ip (default: all)\n\
        \t\tIf multiple interfaces are present, specifies\n\
        \t\twhich one to bind the listening port to.\n\n\
        \t--maxconn number (default: no limit)\n\
        \t\tSpecifies how many concurrent connections to accept.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit will be closed. Set to zero to disable timeouts.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the request log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for request log.\n\n",
        argv0, server.bindport, server.timeout_secs
    );
}

fn main() -> Result<()> {
    println!("{}/{}.", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut server = Server::new();
    parse_commandline(&mut server)?;

    chdir(server.wwwroot.as_str())
        .with_context(|| format!("failed to change working directory to {}", server.wwwroot))?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    init_sockin(&mut server);

    if let Err(e) = server.poller.add_in(server.sockin, LISTENER_TOKEN) {
        abort!("failed to register listening socket: {}", e);
    }

    let mut connections = HashMap::new();

    // main loop
    while is_running() {
        httpd_poll(&mut server, &mut connections);
    }

    // clean exit
    close(server.sockin).context("failed to close listening socket")?;
    for (_, conn) in connections.drain() {
        free_connection(&mut server, conn);
    }

    println!("Requests: {}", server.num_requests);
    println!("Bytes: {} in, {} out", server.total_in, server.total_out);
    Ok(())
}

/// Where to put the access log.
#[derive(Debug)]
enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}
impl LogSink {
    fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                let message = CString::new(message).unwrap_or_default();
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        "%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

/// Process-wide server context: the listener, the multiplexer, and the knobs
/// from the command line. Passed explicitly to the event loop and to every
/// state-machine call.
struct Server {
    poller: Poller,
    sockin: RawFd,
    bindaddr: Option<String>,
    bindport: u16,
    max_connections: usize,
    timeout_secs: libc::c_int,
    wwwroot: String,
    log_sink: LogSink,
    now: libc::time_t,
    next_id: u64,
    num_requests: u64,
    total_in: u64,
    total_out: u64,
    accepting: bool,
}
impl Server {
    fn new() -> Self {
        let poller = match Poller::create() {
            Ok(poller) => poller,
            Err(e) => abort!("failed to create epoll instance: {}", e),
        };
        Self {
            poller,
            sockin: -1,
            bindaddr: None,
            bindport: DEFAULT_PORT,
            max_connections: usize::MAX,
            timeout_secs: 30,
            wwwroot: ".".to_string(),
            log_sink: LogSink::Stdout,
            now: 0,
            next_id: LISTENER_TOKEN + 1,
            num_requests: 0,
            total_in: 0,
            total_out: 0,
            accepting: true,
        }
    }
}

fn parse_commandline(server: &mut Server) -> Result<()> {
    let mut args = std::env::args();

    let name = args.next().context("expected at least one argument")?;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" => {
                usage(server, &name);
                std::process::exit(0);
            }
            "--port" => {
                let number = args.next().context("missing number after --port")?;
                server.bindport = number
                    .parse()
                    .with_context(|| format!("port number {} is invalid", number))?;
            }
            "--addr" => {
                server.bindaddr = Some(args.next().context("missing ip after --addr")?);
            }
            "--maxconn" => {
                let number = args.next().context("missing number after --maxconn")?;
                server.max_connections = number
                    .parse()
                    .with_context(|| format!("maxconn number {} is invalid", number))?;
            }
            "--timeout" => {
                let number = args.next().context("missing number after --timeout")?;
                server.timeout_secs = number
                    .parse()
                    .with_context(|| format!("timeout number {} is invalid", number))?;
            }
            "--log" => {
                let filename = args.next().context("missing filename after --log")?;
                server.log_sink = LogSink::File(BufWriter::new(
                    OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(&filename)
                        .with_context(|| format!("failed to open log file {}", filename))?,
                ))
            }
            "--syslog" => server.log_sink = LogSink::Syslog,
            arg if !arg.starts_with("--") => {
                server.wwwroot = arg.to_string();
                // Strip ending slash.
                if server.wwwroot.ends_with('/') && server.wwwroot.len() > 1 {
                    server.wwwroot.pop();
                }
            }
            _ => {
                return Err(anyhow!("unknown argument `{}'", arg));
            }
        }
    }
    Ok(())
}

/// Thin wrapper around the level-triggered epoll readiness interface. Every
/// registration carries an opaque token that comes back with the event; the
/// wrapper never interprets it.
struct Poller {
    epfd: RawFd,
}

impl Poller {
    fn create() -> nix::Result<Self> {
        Ok(Self {
            epfd: epoll_create1(EpollCreateFlags::empty())?,
        })
    }

    fn ctl(&self, op: EpollOp, fd: RawFd, flags: EpollFlags, token: u64) -> nix::Result<()> {
        let mut event = EpollEvent::new(flags, token);
        epoll_ctl(self.epfd, op, fd, &mut event)
    }

    fn add_in(&self, fd: RawFd, token: u64) -> nix::Result<()> {
        self.ctl(EpollOp::EpollCtlAdd, fd, EpollFlags::EPOLLIN, token)
    }

    fn update_in(&self, fd: RawFd, token: u64) -> nix::Result<()> {
        self.ctl(EpollOp::EpollCtlMod, fd, EpollFlags::EPOLLIN, token)
    }

    fn update_out(&self, fd: RawFd, token: u64) -> nix::Result<()> {
        self.ctl(EpollOp::EpollCtlMod, fd, EpollFlags::EPOLLOUT, token)
    }

    /// Keeps the descriptor registered but masks all readiness events.
    fn clear(&self, fd: RawFd, token: u64) -> nix::Result<()> {
        self.ctl(EpollOp::EpollCtlMod, fd, EpollFlags::empty(), token)
    }

    fn remove(&self, fd: RawFd) -> nix::Result<()> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None)
    }

    /// Waits for at most one event. Returns None if the wait timed out.
    fn wait_one(&self, timeout_ms: isize) -> nix::Result<Option<(EpollFlags, u64)>> {
        let mut events = [EpollEvent::empty()];
        match epoll_wait(self.epfd, &mut events, timeout_ms)? {
            0 => Ok(None),
            _ => Ok(Some((events[0].events(), events[0].data()))),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        close(self.epfd).ok();
    }
}

// Kernel AIO ABI from <linux/aio_abi.h>, little-endian field order.
const IOCB_CMD_PREAD: u16 = 0;
const IOCB_FLAG_RESFD: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Iocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: i32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

/// Kernel-asynchronous reads against one open file, with completions
/// delivered through an eventfd so the multiplexer can wait on them. Holds a
/// single in-flight control block; at most one read is submitted but not yet
/// reaped at any time.
struct AsyncIo {
    ctx: libc::c_ulong,
    eventfd: RawFd,
    iocb: Box<Iocb>,
    pending: usize,
}

impl AsyncIo {
    fn new() -> nix::Result<Self> {
        let notify_fd = eventfd(0, EfdFlags::EFD_NONBLOCK)?;
        let mut ctx: libc::c_ulong = 0;
        if unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                1 as libc::c_long,
                &mut ctx as *mut libc::c_ulong,
            )
        } < 0
        {
            let errno = Errno::last();
            close(notify_fd).ok();
            return Err(nix::Error::Sys(errno));
        }
        Ok(Self {
            ctx,
            eventfd: notify_fd,
            iocb: Box::new(Iocb::default()),
            pending: 0,
        })
    }

    /// Submits one read of `nbytes` at `offset` into `buf`. The buffer must
    /// stay valid until the completion is reaped or the context destroyed.
    fn submit_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        nbytes: usize,
        offset: libc::off_t,
    ) -> nix::Result<()> {
        *self.iocb = Iocb {
            aio_lio_opcode: IOCB_CMD_PREAD,
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: nbytes as u64,
            aio_offset: offset,
            aio_flags: IOCB_FLAG_RESFD,
            aio_resfd: self.eventfd as u32,
            ..Iocb::default()
        };
        let mut submissions = [&mut *self.iocb as *mut Iocb];
        let submitted = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                submissions.as_mut_ptr(),
            )
        };
        if submitted != 1 {
            return Err(nix::Error::Sys(Errno::last()));
        }
        self.pending = nbytes;
        Ok(())
    }

    /// Consumes the eventfd counter: the number of completions signalled
    /// since the last drain.
    fn drain(&self) -> nix::Result<u64> {
        let mut count = [0u8; 8];
        read(self.eventfd, &mut count)?;
        Ok(u64::from_ne_bytes(count))
    }

    /// Reaps the completed read and returns the number of bytes it produced.
    fn reap(&mut self) -> nix::Result<i64> {
        let mut event = IoEvent::default();
        let reaped = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                1 as libc::c_long,
                1 as libc::c_long,
                &mut event as *mut IoEvent,
                std::ptr::null_mut::<libc::timespec>(),
            )
        };
        if reaped != 1 {
            return Err(nix::Error::Sys(Errno::last()));
        }
        Ok(event.res)
    }
}

impl Drop for AsyncIo {
    fn drop(&mut self) {
        // io_destroy waits out any in-flight read, so it must run before the
        // buffer the read targets is released.
        unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        close(self.eventfd).ok();
    }
}

/// RFC1123 formatted date.
struct HttpDate(libc::time_t);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(libc::time_t);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Local.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging. Logs should not contain control characters or
/// double quotes.
struct LogEncoded<'a>(&'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for i in 0..c.len_utf8() {
                    write!(f, "%{:02X}", buf[i])?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnectionState {
    Initial,
    ReceivingData,
    RequestReceived,
    SendingHeader,
    SendingData,
    AsyncOngoing,
    Sending404,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResourceType {
    None,
    Static,
    Dynamic,
}

/// Per-connection record. Owns the client socket, the open resource file,
/// and (for dynamic resources) the async read context; all of them are
/// released exactly once when the record is dropped, after the event loop
/// has deregistered the descriptors.
struct Connection {
    id: u64,
    socket: TcpStream,
    client: IpAddr,
    last_active: libc::time_t,
    state: ConnectionState,
    res_type: ResourceType,
    file: Option<File>,
    // Declared before the buffers: dropping the context waits out the
    // in-flight read that may still target send_buffer.
    aio: Option<AsyncIo>,
    method: Option<String>,
    request_path: Option<String>,
    filename: String,
    recv_len: usize,
    send_pos: usize,
    send_len: usize,
    file_size: libc::off_t,
    file_pos: libc::off_t,
    total_sent: libc::off_t,
    http_code: u16,
    recv_buffer: [u8; BUFFER_SIZE],
    send_buffer: [u8; BUFFER_SIZE],
}

impl Connection {
    fn new(id: u64, socket: TcpStream, client: IpAddr, now: libc::time_t) -> Self {
        Self {
            id,
            socket,
            client,
            last_active: now,
            state: ConnectionState::Initial,
            res_type: ResourceType::None,
            file: None,
            aio: None,
            method: None,
            request_path: None,
            filename: String::new(),
            recv_len: 0,
            send_pos: 0,
            send_len: 0,
            file_size: 0,
            file_pos: 0,
            total_sent: 0,
            http_code: 0,
            recv_buffer: [0; BUFFER_SIZE],
            send_buffer: [0; BUFFER_SIZE],
        }
    }
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    for i in 0..haystack.len() {
        if haystack[i..].starts_with(needle) {
            return Some(i);
        }
    }
    None
}

/// End of headers is a literal CRLFCRLF.
fn has_header_terminator(request: &[u8]) -> bool {
    find(b"\r\n\r\n", request).is_some()
}

/// Extracts the method and path from a complete buffered request. Fails if
/// the parse is incomplete, leaves buffered bytes unconsumed, or yields no
/// path.
fn parse_request(request: &[u8]) -> Option<(String, String)> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(request) {
        Ok(httparse::Status::Complete(consumed)) if consumed == request.len() => {}
        _ => return None,
    }
    match (parsed.method, parsed.path) {
        (Some(method), Some(path)) => Some((method.to_string(), path.to_string())),
        _ => None,
    }
}

/// Decides how a parsed path is served and resolves its filesystem path,
/// anchored at the working directory.
fn classify_resource(path: &str) -> Option<(ResourceType, String)> {
    let res_type = if path.contains(STATIC_PREFIX) {
        ResourceType::Static
    } else if path.contains(DYNAMIC_PREFIX) {
        ResourceType::Dynamic
    } else {
        return None;
    };
    Some((res_type, format!(".{}", path)))
}

/// Opens the resolved file read-only and records its size.
fn open_file(conn: &mut Connection) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&conn.filename)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(std::io::ErrorKind::NotFound.into());
    }
    conn.file_size = metadata.len() as libc::off_t;
    conn.file = Some(file);
    Ok(())
}

/// Formats the 200 response header for a file of the given size.
fn reply_header_200(
    now: libc::time_t,
    last_modified: libc::time_t,
    file_size: libc::off_t,
) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
        Date: {}\r\n\
        Server: {}\r\n\
        Last-Modified: {}\r\n\
        Accept-Ranges: bytes\r\n\
        Vary: Accept-Encoding\r\n\
        Connection: close\r\n\
        Content-Type: text/html\r\n\
        Content-Length: {}\r\n\
        \r\n",
        HttpDate(now),
        SERVER_TOKEN,
        HttpDate(last_modified),
        file_size,
    )
}

const REPLY_HEADER_404: &str = "HTTP/1.1 404 Not Found\r\n\
    Content-Type: text/html\r\n\
    Connection: close\r\n\
    \r\n";

/// Stages a response header in the send buffer.
fn stage_reply(conn: &mut Connection, reply: &str) {
    let bytes = reply.as_bytes();
    let len = min(bytes.len(), BUFFER_SIZE);
    conn.send_buffer[..len].copy_from_slice(&bytes[..len]);
    conn.send_pos = 0;
    conn.send_len = len;
}

/// Stages the 404 response once and moves the connection to the 404 phase.
fn stage_404(conn: &mut Connection) {
    stage_reply(conn, REPLY_HEADER_404);
    conn.http_code = 404;
    conn.state = ConnectionState::Sending404;
}

/// Stages the 200 header for the opened resource.
fn prepare_reply_header(server: &Server, conn: &mut Connection) {
    let last_modified = conn
        .file
        .as_ref()
        .and_then(|file| file.metadata().ok())
        .and_then(|metadata| metadata.modified().ok())
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as libc::time_t)
        .unwrap_or(server.now);
    stage_reply(
        conn,
        &reply_header_200(server.now, last_modified, conn.file_size),
    );
    conn.http_code = 200;
}

/// Reads into the receive buffer. Would-block retains the phase; zero bytes
/// from the peer closes the connection; the end-of-headers marker or a full
/// buffer completes the request.
fn receive_data(server: &mut Server, conn: &mut Connection) {
    let len = conn.recv_len;
    let recvd = match socket::recv(
        conn.socket.as_raw_fd(),
        &mut conn.recv_buffer[len..],
        socket::MsgFlags::empty(),
    ) {
        Ok(0) => {
            conn.state = ConnectionState::Closed;
            return;
        }
        Ok(recvd) => recvd,
        Err(nix::Error::Sys(Errno::EAGAIN)) => {
            // would block
            return;
        }
        Err(_) => {
            conn.state = ConnectionState::Closed;
            return;
        }
    };
    conn.recv_len += recvd;
    conn.last_active = server.now;
    server.total_in += recvd as u64;

    if conn.recv_len >= BUFFER_SIZE || has_header_terminator(&conn.recv_buffer[..conn.recv_len]) {
        conn.state = ConnectionState::RequestReceived;
    }
}

/// Flushes the staged bytes in the send buffer. Returns false on fatal
/// failure; would-block makes no progress and retains the phase.
fn send_buffered(server: &mut Server, conn: &mut Connection) -> bool {
    if conn.send_len == 0 {
        return true;
    }
    let buf = &conn.send_buffer[conn.send_pos..conn.send_pos + conn.send_len];
    let sent = match socket::send(conn.socket.as_raw_fd(), buf, socket::MsgFlags::empty()) {
        Ok(sent) if sent > 0 => sent,
        Err(nix::Error::Sys(Errno::EAGAIN)) => {
            // would block
            return true;
        }
        _ => {
            // closure or other error
            return false;
        }
    };
    conn.send_pos += sent;
    conn.send_len -= sent;
    conn.total_sent += sent as libc::off_t;
    conn.last_active = server.now;
    server.total_out += sent as u64;
    if conn.send_len == 0 {
        conn.send_pos = 0;
    }
    true
}

/// Zero-copy transfer from the open file to the client socket, starting at
/// the current file offset.
fn send_static(server: &mut Server, conn: &mut Connection) {
    let file_fd = match conn.file.as_ref() {
        Some(file) => file.as_raw_fd(),
        None => {
            conn.state = ConnectionState::Closed;
            return;
        }
    };
    let mut offset = conn.file_pos;
    let remaining = (conn.file_size - conn.file_pos) as usize;
    let sent = match sendfile(conn.socket.as_raw_fd(), file_fd, Some(&mut offset), remaining) {
        Ok(sent) => sent,
        Err(nix::Error::Sys(Errno::EAGAIN)) => {
            // would block
            return;
        }
        _ => {
            conn.state = ConnectionState::Closed;
            return;
        }
    };
    conn.file_pos += sent as libc::off_t;
    conn.total_sent += sent as libc::off_t;
    conn.last_active = server.now;
    server.total_out += sent as u64;

    if conn.file_pos >= conn.file_size {
        // Final byte is out; restore read interest so peer closure stays
        // observable until the record is torn down.
        server
            .poller
            .update_in(conn.socket.as_raw_fd(), conn.id)
            .ok();
        conn.state = ConnectionState::Closed;
    }
}

/// Submits the next chunk read at the current file offset. The connection
/// must hold an open file and an async context.
fn submit_chunk(conn: &mut Connection) -> nix::Result<()> {
    let nbytes = min(BUFFER_SIZE as libc::off_t, conn.file_size - conn.file_pos) as usize;
    let buf = conn.send_buffer.as_mut_ptr();
    let offset = conn.file_pos;
    let file_fd = match conn.file.as_ref() {
        Some(file) => file.as_raw_fd(),
        None => return Err(nix::Error::Sys(Errno::EBADF)),
    };
    match conn.aio.as_mut() {
        Some(aio) => aio.submit_read(file_fd, buf, nbytes, offset),
        None => Err(nix::Error::Sys(Errno::EBADF)),
    }
}

/// First dynamic chunk: binds a fresh async context and notification
/// descriptor, registers it for read interest, and submits the read. A
/// failed submission tears the context down and retries once with a fresh
/// one before giving up on the connection.
fn start_async_io(server: &mut Server, conn: &mut Connection) {
    for _ in 0..2 {
        let aio = match AsyncIo::new() {
            Ok(aio) => aio,
            Err(_) => break,
        };
        if server.poller.add_in(aio.eventfd, conn.id).is_err() {
            break;
        }
        conn.aio = Some(aio);
        if submit_chunk(conn).is_ok() {
            conn.state = ConnectionState::AsyncOngoing;
            return;
        }
        finish_async_io(server, conn);
    }
    conn.state = ConnectionState::Closed;
}

/// Next dynamic chunk, reusing the connection's context. A failed submission
/// tears down the in-flight state and restarts the cycle.
fn continue_async_io(server: &mut Server, conn: &mut Connection) {
    if conn.aio.is_none() {
        conn.state = ConnectionState::Closed;
        return;
    }
    if submit_chunk(conn).is_ok() {
        conn.state = ConnectionState::AsyncOngoing;
        return;
    }
    finish_async_io(server, conn);
    start_async_io(server, conn);
}

/// Deregisters the notification descriptor, then destroys the context and
/// closes the descriptor (in that order).
fn finish_async_io(server: &mut Server, conn: &mut Connection) {
    if let Some(aio) = conn.aio.take() {
        server.poller.remove(aio.eventfd).ok();
    }
}

/// Notification wake-up: consumes the eventfd counter and, if the read
/// completed, stages the just-filled buffer as the outbound chunk.
fn drain_async(server: &mut Server, conn: &mut Connection) {
    let staged = {
        let aio = match conn.aio.as_mut() {
            Some(aio) => aio,
            None => {
                conn.state = ConnectionState::Closed;
                return;
            }
        };
        let completions = match aio.drain() {
            Ok(completions) => completions,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return, // spurious wake-up
            Err(_) => {
                conn.state = ConnectionState::Closed;
                return;
            }
        };
        if completions == 0 {
            return;
        }
        match aio.reap() {
            Ok(result) if result == aio.pending as i64 => aio.pending,
            _ => {
                conn.state = ConnectionState::Closed;
                return;
            }
        }
    };
    conn.send_len = staged;
    conn.send_pos = 0;
    conn.file_pos += staged as libc::off_t;
    conn.last_active = server.now;
    conn.state = ConnectionState::SendingData;
}

/// Buffered send of the current dynamic chunk; refills or finishes when the
/// buffer drains.
fn send_dynamic(server: &mut Server, conn: &mut Connection) {
    if !send_buffered(server, conn) {
        conn.state = ConnectionState::Closed;
        return;
    }
    if conn.send_len > 0 {
        return;
    }
    if conn.file_pos < conn.file_size {
        continue_async_io(server, conn);
    } else {
        finish_async_io(server, conn);
        conn.state = ConnectionState::Closed;
    }
}

fn handle_input(server: &mut Server, conn: &mut Connection) {
    match conn.state {
        ConnectionState::Initial => conn.state = ConnectionState::ReceivingData,
        ConnectionState::ReceivingData => {
            receive_data(server, conn);
            if conn.state != ConnectionState::RequestReceived {
                return;
            }
            server.num_requests += 1;
            match parse_request(&conn.recv_buffer[..conn.recv_len]) {
                Some((method, path)) => {
                    conn.method = Some(method);
                    conn.request_path = Some(path);
                }
                None => {
                    stage_404(conn);
                    return;
                }
            }
            match conn
                .request_path
                .as_deref()
                .and_then(|path| classify_resource(path))
            {
                Some((res_type, filename)) => {
                    conn.res_type = res_type;
                    conn.filename = filename;
                    if open_file(conn).is_err() {
                        stage_404(conn);
                    }
                }
                None => stage_404(conn),
            }
        }
        ConnectionState::AsyncOngoing => drain_async(server, conn),
        _ => conn.state = ConnectionState::Closed,
    }
}

fn handle_output(server: &mut Server, conn: &mut Connection) {
    match conn.state {
        ConnectionState::RequestReceived => {
            prepare_reply_header(server, conn);
            conn.state = ConnectionState::SendingHeader;
        }
        ConnectionState::SendingHeader => {
            if !send_buffered(server, conn) {
                conn.state = ConnectionState::Closed;
                return;
            }
            if conn.send_len > 0 {
                return;
            }
            match conn.res_type {
                ResourceType::Static => conn.state = ConnectionState::SendingData,
                ResourceType::Dynamic => {
                    if conn.file_pos < conn.file_size {
                        start_async_io(server, conn);
                    } else {
                        // empty body: nothing to read, nothing to send
                        conn.state = ConnectionState::Closed;
                    }
                }
                ResourceType::None => conn.state = ConnectionState::Closed,
            }
        }
        ConnectionState::SendingData => match conn.res_type {
            ResourceType::Static => send_static(server, conn),
            ResourceType::Dynamic => send_dynamic(server, conn),
            ResourceType::None => conn.state = ConnectionState::Closed,
        },
        ConnectionState::Sending404 => {
            if !send_buffered(server, conn) {
                conn.state = ConnectionState::Closed;
                return;
            }
            if conn.send_len == 0 {
                conn.state = ConnectionState::Closed;
            }
        }
        _ => conn.state = ConnectionState::Closed,
    }
}

/// Re-arms the multiplexer for the descriptor the next phase waits on: read
/// interest while receiving or while an async read is in flight, write
/// interest otherwise. While the notification descriptor is armed the client
/// socket is masked, so at most one descriptor carries write interest and
/// every wake-up is unambiguous.
fn update_interest(server: &mut Server, conn: &mut Connection) {
    let sockfd = conn.socket.as_raw_fd();
    let result = match conn.state {
        ConnectionState::Initial | ConnectionState::ReceivingData => {
            server.poller.update_in(sockfd, conn.id)
        }
        ConnectionState::RequestReceived
        | ConnectionState::SendingHeader
        | ConnectionState::Sending404 => server.poller.update_out(sockfd, conn.id),
        ConnectionState::SendingData => match (conn.res_type, conn.aio.as_ref()) {
            (ResourceType::Dynamic, Some(aio)) => server
                .poller
                .update_out(aio.eventfd, conn.id)
                .and_then(|_| server.poller.clear(sockfd, conn.id)),
            (ResourceType::Dynamic, None) => Err(nix::Error::Sys(Errno::EBADF)),
            _ => server.poller.update_out(sockfd, conn.id),
        },
        ConnectionState::AsyncOngoing => match conn.aio.as_ref() {
            Some(aio) => server
                .poller
                .update_in(aio.eventfd, conn.id)
                .and_then(|_| server.poller.clear(sockfd, conn.id)),
            None => Err(nix::Error::Sys(Errno::EBADF)),
        },
        ConnectionState::Closed => Ok(()),
    };
    if result.is_err() {
        conn.state = ConnectionState::Closed;
    }
}

/// Dispatches one readiness event to the connection's state machine and
/// re-arms its interest.
fn handle_client(server: &mut Server, events: EpollFlags, conn: &mut Connection) {
    if events.contains(EpollFlags::EPOLLIN) {
        handle_input(server, conn);
    }
    if events.contains(EpollFlags::EPOLLOUT) {
        handle_output(server, conn);
    }
    if events.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
        && conn.state != ConnectionState::Closed
    {
        conn.state = ConnectionState::Closed;
    }
    if conn.state != ConnectionState::Closed {
        update_interest(server, conn);
    }
}

/// Add a connection's details to the logfile.
fn log_connection(server: &mut Server, conn: &Connection) {
    if conn.http_code == 0 {
        return; // invalid - died in request
    }
    let method = match &conn.method {
        Some(method) => method,
        // invalid - didn't parse
        None => return,
    };
    let path = match &conn.request_path {
        Some(path) => path,
        None => return,
    };
    let message = format!(
        "{} - - {} \"{} {} HTTP/1.1\" {} {}\n",
        conn.client,
        ClfDate(server.now),
        LogEncoded(method),
        LogEncoded(path),
        conn.http_code,
        conn.total_sent,
    );
    server
        .log_sink
        .log(&message)
        .expect("failed to write log message");
}

/// Log a connection, deregister its descriptors, and release the record.
/// Deregistration happens before the drop closes anything.
fn free_connection(server: &mut Server, mut conn: Box<Connection>) {
    log_connection(server, &conn);
    server.poller.remove(conn.socket.as_raw_fd()).ok();
    if let Some(aio) = conn.aio.take() {
        server.poller.remove(aio.eventfd).ok();
    }
    server.accepting = true; // Try to resume accepting if we ran out of sockets.
}

/// Accept a connection from sockin and register it with the multiplexer.
fn accept_connection(server: &mut Server, connections: &mut HashMap<u64, Box<Connection>>) {
    let fd = match socket::accept(server.sockin) {
        Ok(fd) => fd,
        Err(e) => {
            // Failed to accept, but try to keep serving existing connections.
            if e.as_errno() == Some(Errno::EMFILE) || e.as_errno() == Some(Errno::ENFILE) {
                server.accepting = false;
            }
            eprintln!("warning: accept() failed: {}", e);
            return;
        }
    };

    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    // `socket::accept` doesn't expose the peer address, so request it separately.
    let client = match socket::getpeername(stream.as_raw_fd()) {
        Ok(socket::SockAddr::Inet(addr)) => addr.ip().to_std(),
        Ok(_) => {
            eprintln!("warning: getpeername returned unexpected address type");
            return;
        }
        Err(e) => {
            eprintln!("warning: getpeername() failed: {}", e);
            return;
        }
    };

    if let Err(e) = stream.set_nonblocking(true) {
        eprintln!("warning: set_nonblocking failed: {}", e);
        return;
    }

    let id = server.next_id;
    server.next_id += 1;

    let conn = Box::new(Connection::new(id, stream, client, server.now));
    if let Err(e) = server.poller.add_in(conn.socket.as_raw_fd(), id) {
        eprintln!("warning: failed to register connection: {}", e);
        return;
    }
    connections.insert(id, conn);
}

/// Close connections that have been idle for more than timeout_secs.
fn sweep_timeouts(server: &mut Server, connections: &mut HashMap<u64, Box<Connection>>) {
    if server.timeout_secs <= 0 {
        return;
    }
    let expired: Vec<u64> = connections
        .iter()
        .filter(|(_, conn)| server.now - conn.last_active >= server.timeout_secs as libc::time_t)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        if let Some(conn) = connections.remove(&id) {
            free_connection(server, conn);
        }
    }
}

/// Arms the listener only while below the connection cap and able to accept.
fn update_listener_interest(server: &mut Server, active: usize) {
    let want = server.accepting && active < server.max_connections;
    let result = if want {
        server.poller.update_in(server.sockin, LISTENER_TOKEN)
    } else {
        server.poller.clear(server.sockin, LISTENER_TOKEN)
    };
    if let Err(e) = result {
        abort!("failed to update listener interest: {}", e);
    }
}

/// One iteration of the event loop: wait for a single event, dispatch it,
/// reap closed connections, sweep idle ones.
fn httpd_poll(server: &mut Server, connections: &mut HashMap<u64, Box<Connection>>) {
    let timeout_ms = if server.timeout_secs > 0 && !connections.is_empty() {
        server.timeout_secs as isize * 1000
    } else {
        -1
    };

    let event = match server.poller.wait_one(timeout_ms) {
        Ok(event) => event,
        Err(nix::Error::Sys(Errno::EINTR)) => return, // interrupted by signal
        Err(e) => abort!("epoll_wait failed: {}", e),
    };

    // update time
    server.now = Utc::now().timestamp();

    if let Some((events, token)) = event {
        if token == LISTENER_TOKEN {
            if events.contains(EpollFlags::EPOLLIN) {
                accept_connection(server, connections);
            }
        } else {
            let closed = match connections.get_mut(&token) {
                Some(conn) => {
                    handle_client(server, events, conn);
                    conn.state == ConnectionState::Closed
                }
                None => false,
            };
            if closed {
                if let Some(conn) = connections.remove(&token) {
                    free_connection(server, conn);
                }
            }
        }
    }

    sweep_timeouts(server, connections);
    update_listener_interest(server, connections.len());
}

fn listening_socket_addr(server: &Server) -> Result<SocketAddr, AddrParseError> {
    Ok(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from_str(server.bindaddr.as_deref().unwrap_or("0.0.0.0"))?,
        server.bindport,
    )))
}

/// Initialize the sockin member of the server context. This is the socket
/// that we accept connections from.
fn init_sockin(server: &mut Server) {
    server.sockin = match socket::socket(
        socket::AddressFamily::Inet,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        socket::SockProtocol::Tcp,
    ) {
        Ok(sockin) => sockin,
        Err(e) => abort!(
            "failed to create listening socket: {}",
            e.as_errno().map(|errno| errno.desc()).unwrap_or("unknown")
        ),
    };

    // reuse address
    if let Err(e) = socket::setsockopt(server.sockin, socket::sockopt::ReuseAddr, &true) {
        abort!(
            "failed to set SO_REUSEADDR: {}",
            e.as_errno().map(|errno| errno.desc()).unwrap_or("unknown")
        );
    }

    let socket_addr = match listening_socket_addr(server) {
        Ok(socket_addr) => socket_addr,
        Err(_) => abort!("malformed --addr argument"),
    };

    if let Err(e) = socket::bind(
        server.sockin,
        &socket::SockAddr::Inet(socket::InetAddr::from_std(&socket_addr)),
    ) {
        abort!(
            "failed to bind port {}: {}",
            server.bindport,
            e.as_errno().map(|errno| errno.desc()).unwrap_or("unknown")
        );
    }

    println!("listening on: http://{}/", socket_addr);

    if let Err(e) = socket::listen(server.sockin, DEFAULT_LISTEN_BACKLOG) {
        abort!(
            "failed to listen on socket: {}",
            e.as_errno().map(|errno| errno.desc()).unwrap_or("unknown")
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use test_case::test_case;

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(784111777).to_string(),
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );
    }

    #[test]
    fn clf_date_works() {
        // contains system's local timezone
        assert!(ClfDate(1620965123).to_string().contains("2021"));
    }

    #[test]
    fn log_encoded_works() {
        assert_eq!(
            LogEncoded("some\"log\tcrab\u{1F980}").to_string(),
            "some%22log%09crab%F0%9F%A6%80"
        );
    }

    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", true ; "complete request")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: x", false ; "incomplete request")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\n\r", false ; "partial terminator")]
    #[test_case(b"", false ; "empty request")]
    fn has_header_terminator_works(request: &[u8], expected: bool) {
        assert_eq!(has_header_terminator(request), expected);
    }

    #[test]
    fn parse_request_works() {
        let (method, path) =
            parse_request(b"GET /static/index.html HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/static/index.html");
    }

    #[test_case(b"GET /x HTTP/1.1\r\nHost: x\r\n" ; "missing terminator")]
    #[test_case(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\ntrailing" ; "bytes beyond the terminator")]
    #[test_case(b"\r\n\r\n" ; "no request line")]
    fn parse_request_rejects(request: &[u8]) {
        assert!(parse_request(request).is_none());
    }

    #[test_case("/static/index.html", Some(ResourceType::Static) ; "static path")]
    #[test_case("/dynamic/big.dat", Some(ResourceType::Dynamic) ; "dynamic path")]
    #[test_case("/etc/passwd", None ; "unclassified path")]
    #[test_case("/", None ; "bare root")]
    fn classify_resource_works(path: &str, expected: Option<ResourceType>) {
        assert_eq!(
            classify_resource(path).map(|(res_type, _)| res_type),
            expected
        );
    }

    #[test]
    fn classify_resource_resolves_filename() {
        let (_, filename) = classify_resource("/static/index.html").unwrap();
        assert_eq!(filename, "./static/index.html");
    }

    #[test]
    fn reply_header_200_works() {
        assert_eq!(
            reply_header_200(784111777, 784111777, 7),
            "HTTP/1.1 200 OK\r\n\
            Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
            Server: Apache/2.2.9\r\n\
            Last-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
            Accept-Ranges: bytes\r\n\
            Vary: Accept-Encoding\r\n\
            Connection: close\r\n\
            Content-Type: text/html\r\n\
            Content-Length: 7\r\n\
            \r\n"
        );
    }

    #[test]
    fn reply_header_404_works() {
        assert_eq!(
            REPLY_HEADER_404,
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn reply_headers_fit_the_send_buffer() {
        assert!(reply_header_200(784111777, 784111777, libc::off_t::MAX).len() <= BUFFER_SIZE);
        assert!(REPLY_HEADER_404.len() <= BUFFER_SIZE);
    }

    #[test]
    fn poller_reports_readiness() {
        let poller = Poller::create().unwrap();
        let efd = eventfd(1, EfdFlags::EFD_NONBLOCK).unwrap();
        poller.add_in(efd, 7).unwrap();
        let (events, token) = poller.wait_one(1000).unwrap().expect("no readable event");
        assert!(events.contains(EpollFlags::EPOLLIN));
        assert_eq!(token, 7);
        poller.update_out(efd, 7).unwrap();
        let (events, _) = poller.wait_one(1000).unwrap().expect("no writable event");
        assert!(events.contains(EpollFlags::EPOLLOUT));
        poller.clear(efd, 7).unwrap();
        assert!(poller.wait_one(0).unwrap().is_none());
        poller.remove(efd).unwrap();
        close(efd).unwrap();
    }

    #[test]
    fn async_io_reads_file() {
        let mut file = tempfile::tempfile().expect("failed to create temp file");
        file.write_all(b"kernel async read").unwrap();
        let mut aio = AsyncIo::new().expect("failed to create async context");
        let mut buf = [0u8; 64];
        aio.submit_read(file.as_raw_fd(), buf.as_mut_ptr(), 17, 0)
            .expect("failed to submit read");
        assert_eq!(wait_for_completion(&aio), 1);
        assert_eq!(aio.reap().unwrap(), 17);
        assert_eq!(&buf[..17], b"kernel async read");
    }

    fn wait_for_completion(aio: &AsyncIo) -> u64 {
        for _ in 0..1000 {
            match aio.drain() {
                Ok(count) => return count,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        panic!("timed out waiting for async read completion");
    }
}
