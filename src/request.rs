use std::collections::HashMap;

use crate::config::ServerBlock;

/// Methods the router dispatches on. Anything else parses as `Other` and is
/// answered with 501.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Method {
    Get,
    Post,
    Delete,
    Other,
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsingState {
    StartLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    Done,
}

/// Incrementally parsed HTTP/1.1 request.
///
/// `parse` consumes whatever bytes the reactor hands it and retains partial
/// lines across calls; completion is reported only once the whole message,
/// body included, has been assembled (or an error status is set).
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Index into the reactor's server block list, resolved after headers.
    pub server_block: Option<usize>,
    pub state: ParsingState,
    /// HTTP status code; 0 means no error so far.
    pub error: u16,
    buf: Vec<u8>,
    content_length: usize,
    chunk_remaining: usize,
    in_trailer: bool,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Other,
            path: String::new(),
            query: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            server_block: None,
            state: ParsingState::StartLine,
            error: 0,
            buf: Vec::new(),
            content_length: 0,
            chunk_remaining: 0,
            in_trailer: false,
        }
    }

    /// Ready for the next request on a kept-alive connection.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParsingState::Done || self.error != 0
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    /// Feed a chunk of bytes into the state machine. `blocks` is the full
    /// server list and `endpoint` the (host, port) of the accepting socket,
    /// needed for Host-based server selection and the body size cap.
    pub fn parse(&mut self, data: &[u8], blocks: &[ServerBlock], endpoint: (u32, u16)) {
        self.buf.extend_from_slice(data);
        loop {
            let progressed = match self.state {
                ParsingState::StartLine => self.parse_start_line(),
                ParsingState::Headers => self.parse_header_line(blocks, endpoint),
                ParsingState::Body => self.parse_body(),
                ParsingState::ChunkSize => self.parse_chunk_size(blocks, endpoint),
                ParsingState::ChunkData => self.parse_chunk_data(),
                ParsingState::Done => false,
            };
            if !progressed {
                return;
            }
        }
    }

    fn fail(&mut self, code: u16) -> bool {
        self.error = code;
        self.state = ParsingState::Done;
        false
    }

    /// Take one CRLF-terminated line off the front of the buffer.
    fn take_line(&mut self) -> Option<String> {
        let end = self.buf.windows(2).position(|pair| pair == b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..end + 2);
        Some(line)
    }

    fn parse_start_line(&mut self) -> bool {
        let line = match self.take_line() {
            Some(line) => line,
            None => return false,
        };
        let mut parts = line.split(' ').filter(|part| !part.is_empty());
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version)) => (method, target, version),
            _ => return self.fail(400),
        };
        if parts.next().is_some() || !version.starts_with("HTTP/") {
            return self.fail(400);
        }
        self.method = Method::from_token(method);
        match target.find('?') {
            Some(i) => {
                self.path = target[..i].to_string();
                self.query = target[i + 1..].to_string();
            }
            None => self.path = target.to_string(),
        }
        self.version = version.to_string();
        self.state = ParsingState::Headers;
        true
    }

    fn parse_header_line(&mut self, blocks: &[ServerBlock], endpoint: (u32, u16)) -> bool {
        let line = match self.take_line() {
            Some(line) => line,
            None => return false,
        };
        if line.is_empty() {
            return self.finish_headers(blocks, endpoint);
        }
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => return self.fail(400),
        };
        let name = line[..colon].to_string();
        let value = line[colon + 1..].trim().to_string();
        // Duplicates: last wins.
        self.headers.insert(name, value);
        true
    }

    /// Headers are in: pick the server block and decide how the body is
    /// framed.
    fn finish_headers(&mut self, blocks: &[ServerBlock], endpoint: (u32, u16)) -> bool {
        if self.version == "HTTP/1.1" && !self.headers.contains_key("Host") {
            return self.fail(400);
        }
        self.server_block = self.select_server_block(blocks, endpoint);

        let chunked = self
            .header("Transfer-Encoding")
            .map(|value| value.contains("chunked"))
            .unwrap_or(false);
        if chunked {
            self.state = ParsingState::ChunkSize;
            return true;
        }
        match self.header("Content-Length") {
            Some(value) => {
                let length: usize = match value.parse() {
                    Ok(length) => length,
                    Err(_) => return self.fail(400),
                };
                if length > self.max_body_size(blocks, endpoint) {
                    return self.fail(413);
                }
                self.content_length = length;
                if length == 0 {
                    self.state = ParsingState::Done;
                } else {
                    self.state = ParsingState::Body;
                }
                true
            }
            None if self.method == Method::Post => self.fail(411),
            None => {
                self.state = ParsingState::Done;
                true
            }
        }
    }

    fn parse_body(&mut self) -> bool {
        let missing = self.content_length - self.body.len();
        let take = missing.min(self.buf.len());
        self.body.extend(self.buf.drain(..take));
        if self.body.len() == self.content_length {
            self.state = ParsingState::Done;
            return true;
        }
        false
    }

    fn parse_chunk_size(&mut self, blocks: &[ServerBlock], endpoint: (u32, u16)) -> bool {
        let line = match self.take_line() {
            Some(line) => line,
            None => return false,
        };
        if self.in_trailer {
            // Trailer section after the zero chunk is consumed and ignored.
            if line.is_empty() {
                self.state = ParsingState::Done;
            }
            return true;
        }
        // Chunk extensions after ';' are ignored.
        let size_token = line.split(';').next().unwrap_or("").trim();
        let size = match usize::from_str_radix(size_token, 16) {
            Ok(size) => size,
            Err(_) => return self.fail(400),
        };
        if size == 0 {
            self.in_trailer = true;
            return true;
        }
        if self.body.len() + size > self.max_body_size(blocks, endpoint) {
            return self.fail(413);
        }
        self.chunk_remaining = size;
        self.state = ParsingState::ChunkData;
        true
    }

    fn parse_chunk_data(&mut self) -> bool {
        if self.buf.len() < self.chunk_remaining + 2 {
            return false;
        }
        if &self.buf[self.chunk_remaining..self.chunk_remaining + 2] != b"\r\n" {
            return self.fail(400);
        }
        self.body.extend(self.buf.drain(..self.chunk_remaining));
        self.buf.drain(..2);
        self.chunk_remaining = 0;
        self.state = ParsingState::ChunkSize;
        true
    }

    /// A block matches when it serves the accepting endpoint and lists the
    /// Host header value (port suffix stripped) among its server names. No
    /// name match leaves the selection open; the reactor falls back to the
    /// endpoint's first block once the request is complete.
    fn select_server_block(&self, blocks: &[ServerBlock], endpoint: (u32, u16)) -> Option<usize> {
        let host = self.header("Host")?;
        let host = host.split(':').next().unwrap_or(host);
        blocks.iter().position(|block| {
            (block.host, block.port) == endpoint
                && block.server_names.iter().any(|name| name == host)
        })
    }

    fn max_body_size(&self, blocks: &[ServerBlock], endpoint: (u32, u16)) -> usize {
        let index = self.server_block.or_else(|| {
            blocks
                .iter()
                .position(|block| (block.host, block.port) == endpoint)
        });
        match index {
            Some(index) => blocks[index].client_max_body_size,
            None => usize::MAX,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ENDPOINT: (u32, u16) = (0x7f000001, 8080);

    fn block(names: &[&str], max_body: usize) -> ServerBlock {
        ServerBlock {
            host: ENDPOINT.0,
            port: ENDPOINT.1,
            server_names: names.iter().map(|name| name.to_string()).collect(),
            client_max_body_size: max_body,
            ..ServerBlock::default()
        }
    }

    fn parse_all(raw: &[u8]) -> Request {
        let blocks = vec![block(&["x"], 1 << 20)];
        let mut request = Request::new();
        request.parse(raw, &blocks, ENDPOINT);
        request
    }

    #[test]
    fn simple_get() {
        let request = parse_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(request.is_complete());
        assert_eq!(request.error, 0);
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/index.html");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("Host"), Some("x"));
    }

    #[test]
    fn query_is_split_off() {
        let request = parse_all(b"GET /cgi/echo.py?q=1&r=2 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(request.path, "/cgi/echo.py");
        assert_eq!(request.query, "q=1&r=2");
    }

    #[test]
    fn byte_at_a_time_is_equivalent() {
        let raw = b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let blocks = vec![block(&["x"], 1 << 20)];
        let mut request = Request::new();
        for byte in raw.iter() {
            request.parse(std::slice::from_ref(byte), &blocks, ENDPOINT);
        }
        assert!(request.is_complete());
        assert_eq!(request.error, 0);
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn duplicate_header_last_wins() {
        let request = parse_all(b"GET / HTTP/1.1\r\nHost: x\r\nX-A: 1\r\nX-A: 2\r\n\r\n");
        assert_eq!(request.header("X-A"), Some("2"));
    }

    #[test]
    fn header_value_is_trimmed() {
        let request = parse_all(b"GET / HTTP/1.1\r\nHost:   x  \r\n\r\n");
        assert_eq!(request.header("Host"), Some("x"));
    }

    #[test]
    fn missing_host_is_bad_request() {
        let request = parse_all(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(request.error, 400);
    }

    #[test]
    fn malformed_start_line_is_bad_request() {
        let request = parse_all(b"GET /\r\nHost: x\r\n\r\n");
        assert_eq!(request.error, 400);
    }

    #[test]
    fn header_without_colon_is_bad_request() {
        let request = parse_all(b"GET / HTTP/1.1\r\nHost x\r\n\r\n");
        assert_eq!(request.error, 400);
    }

    #[test]
    fn post_without_length_is_length_required() {
        let request = parse_all(b"POST /p HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(request.error, 411);
    }

    #[test]
    fn body_over_cap_is_payload_too_large() {
        let blocks = vec![block(&["x"], 4)];
        let mut request = Request::new();
        request.parse(
            b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
            &blocks,
            ENDPOINT,
        );
        assert_eq!(request.error, 413);
    }

    #[test]
    fn chunked_body_over_cap_is_payload_too_large() {
        let blocks = vec![block(&["x"], 4)];
        let mut request = Request::new();
        request.parse(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
            &blocks,
            ENDPOINT,
        );
        assert_eq!(request.error, 413);
    }

    #[test]
    fn chunked_body_matches_content_length_encoding() {
        let plain = parse_all(b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world");
        let chunked = parse_all(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
        );
        assert!(plain.is_complete() && chunked.is_complete());
        assert_eq!(plain.error, 0);
        assert_eq!(chunked.error, 0);
        assert_eq!(plain.body, chunked.body);
    }

    #[test]
    fn chunk_extension_is_ignored() {
        let request = parse_all(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n0\r\n\r\n",
        );
        assert_eq!(request.error, 0);
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn chunked_trailer_is_consumed() {
        let request = parse_all(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nX-Trailer: 1\r\n\r\n",
        );
        assert!(request.is_complete());
        assert_eq!(request.error, 0);
        assert_eq!(request.body, b"ok");
    }

    #[test]
    fn bad_chunk_size_is_bad_request() {
        let request = parse_all(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nhello\r\n",
        );
        assert_eq!(request.error, 400);
    }

    #[test]
    fn missing_crlf_after_chunk_is_bad_request() {
        let request = parse_all(
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhelloXX",
        );
        assert_eq!(request.error, 400);
    }

    #[test]
    fn server_block_selected_by_host_name() {
        let blocks = vec![block(&["a"], 1024), block(&["b"], 1024)];
        let mut request = Request::new();
        request.parse(b"GET / HTTP/1.1\r\nHost: b\r\n\r\n", &blocks, ENDPOINT);
        assert_eq!(request.server_block, Some(1));
    }

    #[test]
    fn host_port_suffix_is_stripped() {
        let blocks = vec![block(&["a"], 1024)];
        let mut request = Request::new();
        request.parse(b"GET / HTTP/1.1\r\nHost: a:8080\r\n\r\n", &blocks, ENDPOINT);
        assert_eq!(request.server_block, Some(0));
    }

    #[test]
    fn unmatched_host_leaves_selection_open() {
        let blocks = vec![block(&["a"], 1024)];
        let mut request = Request::new();
        request.parse(b"GET / HTTP/1.1\r\nHost: nope\r\n\r\n", &blocks, ENDPOINT);
        assert!(request.is_complete());
        assert_eq!(request.server_block, None);
    }

    #[test]
    fn unknown_method_parses_as_other() {
        let request = parse_all(b"PATCH / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(request.method, Method::Other);
        assert_eq!(request.error, 0);
    }
}
