use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::socket::{self, InetAddr, MsgFlags, SockAddr};
use nix::unistd;

use crate::config::{self, ServerBlock};
use crate::request::Request;
use crate::response::Response;
use crate::{CLIENT_CONNECTION_TIMEOUT, MAX_CONNECTIONS, MAX_EPOLL_EVENTS};
use crate::{REQUEST_READ_SIZE, RESPONSE_WRITE_SIZE};

const LISTEN_BACKLOG: usize = 128;

/// Listening TCP endpoint, uniquely identified by (host, port). Owns the fd.
#[derive(Debug)]
pub struct Socket {
    pub fd: RawFd,
    pub host: u32,
    pub port: u16,
    pub ip: String,
}

impl Socket {
    /// Create, configure and bind a nonblocking listening socket.
    pub fn setup(host: u32, port: u16) -> Result<Self> {
        let fd = socket::socket(
            socket::AddressFamily::Inet,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_NONBLOCK,
            socket::SockProtocol::Tcp,
        )
        .context("failed to create listening socket")?;
        socket::setsockopt(fd, socket::sockopt::ReuseAddr, &true)
            .context("failed to set SO_REUSEADDR")?;
        let addr = Ipv4Addr::from(host);
        let socket_addr = SocketAddr::V4(SocketAddrV4::new(addr, port));
        socket::bind(fd, &SockAddr::Inet(InetAddr::from_std(&socket_addr)))
            .with_context(|| format!("failed to bind {}", socket_addr))?;
        Ok(Self {
            fd,
            host,
            port,
            ip: addr.to_string(),
        })
    }

    pub fn start_listening(&self) -> Result<()> {
        socket::listen(self.fd, LISTEN_BACKLOG)
            .with_context(|| format!("failed to listen on {}:{}", self.ip, self.port))?;
        Ok(())
    }

    /// Accept one pending connection; the client fd is created nonblocking.
    pub fn accept(&self) -> nix::Result<RawFd> {
        socket::accept4(self.fd, socket::SockFlag::SOCK_NONBLOCK)
    }
}

/// Per-connection state: buffers, timestamps and the listening socket that
/// accepted the connection.
#[derive(Debug)]
pub struct Client {
    pub fd: RawFd,
    pub peer: IpAddr,
    pub last_activity: i64,
    /// Key of the accepting listener in the reactor's socket map.
    pub socket: RawFd,
    pub request: Request,
    pub response: Response,
}

impl Client {
    fn new(fd: RawFd, peer: IpAddr, socket: RawFd) -> Self {
        Self {
            fd,
            peer,
            last_activity: Utc::now().timestamp(),
            socket,
            request: Request::new(),
            response: Response::default(),
        }
    }

    fn is_timed_out(&self, now: i64) -> bool {
        now - self.last_activity > CLIENT_CONNECTION_TIMEOUT
    }
}

/// Single-threaded epoll reactor owning the listening sockets, the server
/// blocks and all live connections.
pub struct ServerManager {
    epoll_fd: RawFd,
    server_blocks: Vec<ServerBlock>,
    socket_map: HashMap<RawFd, Socket>,
    client_map: HashMap<RawFd, Client>,
}

impl ServerManager {
    /// Parse the config and bind one listening socket per distinct
    /// (host, port) endpoint; blocks sharing an endpoint share the socket.
    pub fn setup(config_path: &str) -> Result<Self> {
        let mut server_blocks = config::parse_config(config_path)?;
        debug!("finished config file parsing");
        for block in &server_blocks {
            info!(
                "server setup: name[{}] host[{}] port[{}]",
                block.server_names.first().map(String::as_str).unwrap_or(""),
                block.ip,
                block.port
            );
        }

        let endpoints: BTreeSet<(u32, u16)> = server_blocks
            .iter()
            .map(|block| (block.host, block.port))
            .collect();
        let mut socket_map = HashMap::new();
        for (host, port) in endpoints {
            let socket = Socket::setup(host, port)?;
            debug!("socket setup: host[{}] port[{}]", socket.ip, socket.port);
            for block in &mut server_blocks {
                if (block.host, block.port) == (host, port) {
                    block.socket = socket.fd;
                }
            }
            socket_map.insert(socket.fd, socket);
        }

        Ok(Self {
            epoll_fd: -1,
            server_blocks,
            socket_map,
            client_map: HashMap::new(),
        })
    }

    /// Register the listeners, then dispatch accept/read/write events until
    /// the process is told to stop. Connections idle past the timeout are
    /// swept after every event batch.
    pub fn run(&mut self) -> Result<()> {
        self.epoll_fd =
            epoll_create1(EpollCreateFlags::empty()).context("failed to create epoll instance")?;
        for socket in self.socket_map.values() {
            let mut event = EpollEvent::new(EpollFlags::EPOLLIN, socket.fd as u64);
            epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, socket.fd, &mut event)
                .context("failed to register listening socket")?;
            socket.start_listening()?;
            info!("listening on http://{}:{}/", socket.ip, socket.port);
        }

        let mut events = vec![EpollEvent::empty(); MAX_EPOLL_EVENTS];
        while crate::is_running() {
            let num_events = match epoll_wait(self.epoll_fd, &mut events, -1) {
                Ok(num_events) => num_events,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => return Err(e).context("waiting for epoll events failed"),
            };
            for event in &events[..num_events] {
                let fd = event.data() as RawFd;
                let flags = event.events();
                if self.socket_map.contains_key(&fd) {
                    self.accept_connection(fd);
                } else if !self.client_map.contains_key(&fd) {
                    // Stale event for an fd closed earlier in this batch.
                    unistd::close(fd).ok();
                } else if flags.contains(EpollFlags::EPOLLIN) {
                    self.read_request(fd);
                } else if flags.contains(EpollFlags::EPOLLOUT) {
                    self.send_response(fd);
                } else {
                    self.close_connection(fd);
                }
            }
            self.check_timeouts();
        }
        self.shutdown();
        Ok(())
    }

    fn accept_connection(&mut self, listen_fd: RawFd) {
        if self.client_map.len() >= MAX_CONNECTIONS {
            debug!("connection cap reached, leaving accept to the backlog");
            return;
        }
        let socket = match self.socket_map.get(&listen_fd) {
            Some(socket) => socket,
            None => return,
        };
        let client_fd = match socket.accept() {
            Ok(client_fd) => client_fd,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return,
            Err(e) => {
                warn!("accept() failed: {}", e);
                return;
            }
        };
        let peer = match socket::getpeername(client_fd) {
            Ok(SockAddr::Inet(addr)) => addr.ip().to_std(),
            Ok(_) | Err(_) => {
                warn!("getpeername() failed for fd[{}]", client_fd);
                unistd::close(client_fd).ok();
                return;
            }
        };
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, client_fd as u64);
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, client_fd, &mut event) {
            error!("adding fd[{}] to epoll instance failed: {}", client_fd, e);
            unistd::close(client_fd).ok();
            return;
        }
        self.client_map
            .insert(client_fd, Client::new(client_fd, peer, listen_fd));
        info!(
            "accepted new connection on fd[{}] from address[{}]",
            client_fd, peer
        );
    }

    /// Feed pending bytes to the parser; once the request is framed, build
    /// the response and switch the fd to writable.
    fn read_request(&mut self, fd: RawFd) {
        let endpoint = {
            let client = match self.client_map.get(&fd) {
                Some(client) => client,
                None => return,
            };
            match self.socket_map.get(&client.socket) {
                Some(socket) => (socket.host, socket.port),
                None => return,
            }
        };

        let mut buf = [0u8; REQUEST_READ_SIZE];
        let received = match socket::recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => {
                info!("client fd[{}] closed connection", fd);
                self.close_connection(fd);
                return;
            }
            Ok(received) => received,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return,
            Err(e) => {
                error!("read error on fd[{}]: {}", fd, e);
                self.close_connection(fd);
                return;
            }
        };

        let now = Utc::now().timestamp();
        let client = match self.client_map.get_mut(&fd) {
            Some(client) => client,
            None => return,
        };
        client.last_activity = now;
        client
            .request
            .parse(&buf[..received], &self.server_blocks, endpoint);
        if !client.request.is_complete() {
            return;
        }

        // The endpoint's first block is the default when no server name
        // matched the Host header.
        if client.request.server_block.is_none() {
            let listener = client.socket;
            client.request.server_block = self
                .server_blocks
                .iter()
                .position(|block| block.socket == listener);
        }
        info!(
            "request received from fd[{}] with method[{}] and URI[{}]",
            fd,
            client.request.method.as_str(),
            client.request.path
        );
        let peer = client.peer;
        match client.request.server_block {
            Some(index) => {
                let block = &self.server_blocks[index];
                client.response = Response::build(&client.request, block, peer);
            }
            None => {
                error!("could not find a server block to serve fd[{}]", fd);
                self.close_connection(fd);
                return;
            }
        }

        let mut event = EpollEvent::new(EpollFlags::EPOLLOUT, fd as u64);
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut event) {
            error!("switching fd[{}] to writable failed: {}", fd, e);
            self.close_connection(fd);
        }
    }

    /// Drain the serialized response in bounded writes; when it is fully
    /// sent, either recycle the connection for keep-alive or close it.
    fn send_response(&mut self, fd: RawFd) {
        let client = match self.client_map.get_mut(&fd) {
            Some(client) => client,
            None => return,
        };
        let chunk = client.response.pending().len().min(RESPONSE_WRITE_SIZE);
        let sent = match socket::send(fd, &client.response.pending()[..chunk], MsgFlags::empty()) {
            Ok(sent) => sent,
            Err(nix::Error::Sys(Errno::EAGAIN)) => return,
            Err(e) => {
                info!("could not write on fd[{}]: {}", fd, e);
                self.close_connection(fd);
                return;
            }
        };
        client.response.trim(sent);
        if !client.response.is_drained() {
            return;
        }

        info!(
            "response sent to client fd[{}] with code[{}]",
            fd, client.response.status
        );
        if client.response.keep_alive() {
            client.request.clear();
            client.response.clear();
            let mut event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
            if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut event) {
                error!("switching fd[{}] back to readable failed: {}", fd, e);
                self.close_connection(fd);
            }
        } else {
            self.close_connection(fd);
        }
    }

    fn check_timeouts(&mut self) {
        let now = Utc::now().timestamp();
        let expired: Vec<RawFd> = self
            .client_map
            .values()
            .filter(|client| client.is_timed_out(now))
            .map(|client| client.fd)
            .collect();
        for fd in expired {
            info!("client timeout on fd[{}], closing connection", fd);
            self.close_connection(fd);
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Err(e) = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None::<&mut EpollEvent>)
        {
            debug!("deleting fd[{}] from epoll instance failed: {}", fd, e);
        }
        if let Err(e) = unistd::close(fd) {
            error!("closing fd[{}] failed: {}", fd, e);
        }
        self.client_map.remove(&fd);
        info!("closed connection on fd[{}]", fd);
    }

    fn shutdown(&mut self) {
        let fds: Vec<RawFd> = self.client_map.keys().copied().collect();
        for fd in fds {
            self.close_connection(fd);
        }
        for socket in self.socket_map.values() {
            unistd::close(socket.fd).ok();
        }
        unistd::close(self.epoll_fd).ok();
        info!("server stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::net::TcpStream;

    #[test]
    fn client_times_out_after_idle_period() {
        let client = Client::new(
            3,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            4,
        );
        let now = client.last_activity;
        assert!(!client.is_timed_out(now));
        assert!(!client.is_timed_out(now + CLIENT_CONNECTION_TIMEOUT));
        assert!(client.is_timed_out(now + CLIENT_CONNECTION_TIMEOUT + 1));
    }

    #[test]
    fn socket_accepts_connections_without_blocking() {
        let localhost = u32::from(Ipv4Addr::LOCALHOST);
        let socket = Socket::setup(localhost, 0).expect("failed to set up socket");
        socket.start_listening().expect("failed to listen");

        // Nothing pending yet: nonblocking accept reports EAGAIN.
        assert_eq!(
            socket.accept(),
            Err(nix::Error::Sys(Errno::EAGAIN))
        );

        let port = match socket::getsockname(socket.fd) {
            Ok(SockAddr::Inet(addr)) => addr.port(),
            _ => panic!("getsockname failed"),
        };
        let _stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect");
        let client_fd = loop {
            match socket.accept() {
                Ok(fd) => break fd,
                Err(nix::Error::Sys(Errno::EAGAIN)) => continue,
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        assert!(client_fd >= 0);
        unistd::close(client_fd).ok();
        unistd::close(socket.fd).ok();
    }
}
