#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if let Ok(_) = TcpStream::connect(("localhost", port)) {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A webserv instance serving a tempdir docroot. The config file lives in
/// its own tempdir so it never shows up in directory listings.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
    _config_dir: TempDir,
}

impl Server {
    /// Spawn the server binary against a config produced by `build_config`,
    /// which receives the docroot path and the chosen port. Files referenced
    /// by config directives must exist in `root` beforehand.
    pub fn start<F>(root: TempDir, build_config: F) -> Self
    where
        F: FnOnce(&str, u16) -> String,
    {
        // Get an unused port. Assumes the port won't be reused before we
        // start the server.
        let port = get_unused_port().expect("failed to get unused port");

        let config = build_config(root.path().to_str().expect("path is not valid UTF-8"), port);
        let config_dir = tempdir().expect("failed to create config tempdir");
        let config_path = config_dir.path().join("webserv.conf");
        std::fs::write(&config_path, config).expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        let server = Self {
            _child: child,
            port,
            root,
            _config_dir: config_dir,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(server.port), "failed to connect to webserv");

        server
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    /// Send raw bytes and collect everything until the server closes.
    pub fn raw(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).expect("failed to write request");
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }

    /// One request/response round trip. `Host: x` and `Connection: close`
    /// are filled in unless the caller supplies them.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Response {
        let mut stream = self.stream();
        write!(stream, "{} {} HTTP/1.1\r\n", method, path).unwrap();
        let mut has_host = false;
        let mut has_connection = false;
        let mut has_framing = false;
        for (name, value) in headers {
            write!(stream, "{}: {}\r\n", name, value).unwrap();
            match *name {
                "Host" => has_host = true,
                "Connection" => has_connection = true,
                "Content-Length" | "Transfer-Encoding" => has_framing = true,
                _ => {}
            }
        }
        if !has_host {
            write!(stream, "Host: x\r\n").unwrap();
        }
        if !has_connection {
            write!(stream, "Connection: close\r\n").unwrap();
        }
        if !body.is_empty() && !has_framing {
            write!(stream, "Content-Length: {}\r\n", body.len()).unwrap();
        }
        write!(stream, "\r\n").unwrap();
        stream.write_all(body).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn get(&self, path: &str) -> Response {
        self.request("GET", path, &[], b"")
    }
}

/// One server block covering the whole docroot with every method allowed
/// and autoindex on.
pub fn basic_config(root: &str, port: u16) -> String {
    format!(
        "server {{\n\
         \tlisten 127.0.0.1:{port};\n\
         \tserver_name x;\n\
         \troot {root}/;\n\
         \tlocation / {{\n\
         \t\tallowed_methods GET POST DELETE;\n\
         \t\tautoindex on;\n\
         \t}}\n\
         }}\n",
        port = port,
        root = root,
    )
}

/// Parsed HTTP response.
pub struct Response {
    pub response_line: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        body.resize(content_length, 0);
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn status(&self) -> u16 {
        self.response_line
            .split(' ')
            .nth(1)
            .expect("malformed response line")
            .parse()
            .expect("malformed status code")
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(self.body.as_deref().unwrap_or(b"")).into_owned()
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
