use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;

use chrono::{TimeZone, Utc};
use log::{debug, error};
use once_cell::sync::Lazy;

use crate::cgi;
use crate::config::{AllowedMethods, Location, ServerBlock};
use crate::request::{Method, Request};

/// Fixed extension-to-MIME table; anything else is served as the fallback.
static MIME_TYPES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(".html", "text/html");
    map.insert(".htm", "text/html");
    map.insert(".css", "text/css");
    map.insert(".js", "application/javascript");
    map.insert(".png", "image/png");
    map.insert(".jpg", "image/jpeg");
    map.insert(".jpeg", "image/jpeg");
    map.insert(".gif", "image/gif");
    map.insert(".ico", "image/x-icon");
    map.insert(".pdf", "application/pdf");
    map.insert(".txt", "text/plain");
    map.insert(".mp3", "audio/mpeg");
    map.insert(".mp4", "video/mp4");
    map.insert(".sh", "application/x-sh");
    map.insert(".json", "application/json");
    map
});

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

fn mime_type(path: &str) -> &'static str {
    path.rfind('.')
        .and_then(|dot| MIME_TYPES.get(&path[dot..]))
        .copied()
        .unwrap_or(DEFAULT_MIME_TYPE)
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        301 => "Moved Permanently",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        511 => "Network Authentication Required",
        _ => "Undefined",
    }
}

/// RFC1123 formatted date.
struct HttpDate(i64);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Escape < > & ' " into HTML entities.
struct HtmlEscaped<'a>(&'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string to be an RFC3986-compliant URL part.
struct UrlEncoded<'a>(&'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}

struct ListingEntry {
    name: String,
    is_dir: bool,
    size: u64,
}

/// Directory listing body: `..` first, directories with a trailing slash,
/// file sizes after the name.
struct Listing(Vec<ListingEntry>);

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<a href=\"..\">..</a>/\n")?;
        for entry in &self.0 {
            if entry.is_dir {
                write!(
                    f,
                    "<a href=\"{}/\">{}/</a>\n",
                    UrlEncoded(&entry.name),
                    HtmlEscaped(&entry.name)
                )?;
            } else {
                write!(
                    f,
                    "<a href=\"{}\">{}</a>\t\t{} bytes\n",
                    UrlEncoded(&entry.name),
                    HtmlEscaped(&entry.name),
                    entry.size
                )?;
            }
        }
        Ok(())
    }
}

fn autoindex_page(fs_dir: &str, display_path: &str) -> std::io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(fs_dir)? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        entries.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(format!(
        "<!DOCTYPE html><html><head><title>Index of {path}</title></head>\
         <body><h1>Index of {path}</h1><hr><pre>\n{listing}</pre><hr></body></html>",
        path = HtmlEscaped(display_path),
        listing = Listing(entries),
    ))
}

fn default_error_page(code: u16) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Error</title></head><body>\
         <center><h1>{} {}</h1></center><hr><center>webserv</center></body></html>",
        code,
        reason_phrase(code)
    )
}

fn success_page(code: u16) -> String {
    let (title, detail) = match code {
        200 => ("Saving successful", "Data updated."),
        201 => ("Creation successful", "File created."),
        202 => ("Upload successful", "File saved."),
        _ => ("Success", ""),
    };
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head><body>\
         <center><h1>{title}</h1><p>{detail}</p></center><hr><center>webserv</center></body></html>",
        title = title,
        detail = detail,
    )
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Longest-prefix location match; an exact match wins outright.
pub fn find_location<'a>(
    path: &str,
    locations: &'a HashMap<String, Location>,
) -> Option<(&'a str, &'a Location)> {
    let mut best: Option<(&str, &Location)> = None;
    for (prefix, location) in locations {
        if path == prefix.as_str() {
            return Some((prefix, location));
        }
        if path.starts_with(prefix.as_str())
            && best.map(|(b, _)| prefix.len() > b.len()).unwrap_or(true)
        {
            best = Some((prefix, location));
        }
    }
    best
}

/// Map the request path into the filesystem: root + path, with the matched
/// prefix swapped for the alias when one is set.
fn resolve_path(server: &ServerBlock, prefix: &str, location: &Location, path: &str) -> String {
    let full = format!("{}{}", server.root, path);
    if location.alias.is_empty() {
        return full;
    }
    let mapped = format!("{}{}", server.root, prefix);
    match full.strip_prefix(mapped.as_str()) {
        Some(rest) => format!("{}{}", location.alias, rest),
        None => full,
    }
}

fn cgi_interpreter<'a>(path: &str, cgi: &'a HashMap<String, String>) -> Option<&'a str> {
    cgi.iter()
        .find(|(extension, _)| path.ends_with(extension.as_str()))
        .map(|(_, interpreter)| interpreter.as_str())
}

enum Routed<'a> {
    Matched(&'a str, &'a Location),
    Status(u16),
    Redirect(String),
}

/// Location lookup, method gate and redirect check shared by all handlers.
fn route<'a>(
    request: &Request,
    server: &'a ServerBlock,
    allowed: fn(&AllowedMethods) -> bool,
) -> Routed<'a> {
    let (prefix, location) = match find_location(&request.path, &server.locations) {
        Some(found) => found,
        None => return Routed::Status(404),
    };
    if !allowed(&location.allowed_methods) {
        return Routed::Status(405);
    }
    if !location.redirection.is_empty() {
        return Routed::Redirect(location.redirection.clone());
    }
    Routed::Matched(prefix, location)
}

/// Outgoing HTTP message. `serialized` holds the full wire form and is
/// trimmed from the front as the reactor drains it.
#[derive(Debug, Default)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub location: String,
    pub connection: String,
    pub extra_headers: Vec<(String, String)>,
    pub content: Vec<u8>,
    pub serialized: Vec<u8>,
}

impl Response {
    /// Build the complete response for a framed request.
    pub fn build(request: &Request, server: &ServerBlock, peer: IpAddr) -> Self {
        let mut response = Self::default();
        response.status = if request.error != 0 { request.error } else { 200 };
        if response.status == 200 {
            match request.method {
                Method::Get => response.handle_get(request, server, peer),
                Method::Post => response.handle_post(request, server, peer),
                Method::Delete => response.handle_delete(request, server),
                Method::Other => response.status = 501,
            }
        }
        response.assemble(request, server);
        debug!(
            "finished building response with status [{}]",
            response.status
        );
        response
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn pending(&self) -> &[u8] {
        &self.serialized
    }

    /// Drop the prefix that has been written to the socket.
    pub fn trim(&mut self, sent: usize) {
        self.serialized.drain(..sent);
    }

    pub fn is_drained(&self) -> bool {
        self.serialized.is_empty()
    }

    pub fn keep_alive(&self) -> bool {
        self.connection == "keep-alive"
    }

    fn handle_get(&mut self, request: &Request, server: &ServerBlock, peer: IpAddr) {
        let (prefix, location) = match route(request, server, |methods| methods.get) {
            Routed::Status(code) => {
                self.status = code;
                return;
            }
            Routed::Redirect(target) => {
                self.redirect(target);
                return;
            }
            Routed::Matched(prefix, location) => (prefix, location),
        };
        let fs_path = resolve_path(server, prefix, location, &request.path);

        if !location.cgi.is_empty() {
            if let Some(interpreter) = cgi_interpreter(&fs_path, &location.cgi) {
                self.run_cgi(interpreter, &fs_path, request, server, peer);
                return;
            }
        }

        let metadata = match fs::metadata(&fs_path) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.status = 404;
                return;
            }
        };
        if metadata.is_dir() {
            if !request.path.ends_with('/') {
                self.redirect(format!("{}/", request.path));
                return;
            }
            if !location.index.is_empty() {
                self.serve_file(&location.index);
                return;
            }
            if location.autoindex {
                let display = fs_path
                    .strip_prefix(server.root.as_str())
                    .unwrap_or(fs_path.as_str());
                match autoindex_page(&fs_path, display) {
                    Ok(page) => {
                        self.content = page.into_bytes();
                        self.content_type = "text/html".to_string();
                    }
                    Err(e) => {
                        error!("failed to list directory {}: {}", fs_path, e);
                        self.status = 500;
                    }
                }
                return;
            }
            self.status = 403;
        } else if metadata.is_file() {
            self.serve_file(&fs_path);
        } else {
            self.status = 404;
        }
    }

    fn handle_post(&mut self, request: &Request, server: &ServerBlock, peer: IpAddr) {
        let (prefix, location) = match route(request, server, |methods| methods.post) {
            Routed::Status(code) => {
                self.status = code;
                return;
            }
            Routed::Redirect(target) => {
                self.redirect(target);
                return;
            }
            Routed::Matched(prefix, location) => (prefix, location),
        };
        let fs_path = resolve_path(server, prefix, location, &request.path);

        if !location.cgi.is_empty() {
            if let Some(interpreter) = cgi_interpreter(&fs_path, &location.cgi) {
                self.run_cgi(interpreter, &fs_path, request, server, peer);
                return;
            }
        }

        match fs::metadata(&fs_path) {
            Ok(metadata) if metadata.is_dir() => {
                let multipart = request
                    .header("Content-Type")
                    .map(|value| value.contains("multipart/form-data"))
                    .unwrap_or(false);
                if multipart {
                    self.upload_multipart(&request.body, &fs_path);
                } else {
                    // The upload directory is the canonical target for plain
                    // bodies posted at a directory.
                    let dir = if !location.upload.is_empty() {
                        location.upload.as_str()
                    } else if !location.alias.is_empty() {
                        location.alias.as_str()
                    } else {
                        fs_path.trim_end_matches('/')
                    };
                    let target =
                        format!("{}/{}", dir, Utc::now().format("%Y%m%d%H%M%S"));
                    self.write_new_file(&target, &request.body, 202);
                }
            }
            Ok(metadata) if metadata.is_file() => {
                let appended = fs::OpenOptions::new()
                    .append(true)
                    .open(&fs_path)
                    .and_then(|mut file| file.write_all(&request.body));
                match appended {
                    Ok(()) => self.status = 200,
                    Err(e) => {
                        error!("failed to append to {}: {}", fs_path, e);
                        self.status = 500;
                    }
                }
            }
            Ok(_) => self.status = 500,
            Err(_) => self.write_new_file(&fs_path, &request.body, 201),
        }
        if matches!(self.status, 200 | 201 | 202) {
            self.content = success_page(self.status).into_bytes();
            self.content_type = "text/html".to_string();
        }
    }

    /// Pull the file out of a multipart/form-data body and store it in the
    /// target directory. The first body line is the boundary marker.
    fn upload_multipart(&mut self, body: &[u8], dir: &str) {
        let marker_end = match find(b"\r\n", body) {
            Some(end) => end,
            None => {
                self.status = 400;
                return;
            }
        };
        let terminator = [&body[..marker_end], b"--"].concat();

        let filename = match find(b"filename=\"", body) {
            Some(start) => {
                let start = start + b"filename=\"".len();
                match find(b"\"", &body[start..]) {
                    Some(len) => String::from_utf8_lossy(&body[start..start + len]).into_owned(),
                    None => {
                        self.status = 400;
                        return;
                    }
                }
            }
            None => {
                self.status = 400;
                return;
            }
        };
        if filename.is_empty() || filename.contains('/') {
            self.status = 400;
            return;
        }

        let content_start = match find(b"\r\n\r\n", body) {
            Some(start) => start + 4,
            None => {
                self.status = 400;
                return;
            }
        };
        let content_end = match find(&terminator, body) {
            Some(end) if end >= 2 && end - 2 >= content_start => end - 2,
            _ => {
                self.status = 400;
                return;
            }
        };

        let target = format!("{}/{}", dir.trim_end_matches('/'), filename);
        self.write_new_file(&target, &body[content_start..content_end], 202);
    }

    fn write_new_file(&mut self, path: &str, content: &[u8], success: u16) {
        match fs::write(path, content) {
            Ok(()) => self.status = success,
            Err(e) => {
                error!("failed to write {}: {}", path, e);
                self.status = 500;
            }
        }
    }

    fn handle_delete(&mut self, request: &Request, server: &ServerBlock) {
        let (prefix, location) = match route(request, server, |methods| methods.delete) {
            Routed::Status(code) => {
                self.status = code;
                return;
            }
            Routed::Redirect(target) => {
                self.redirect(target);
                return;
            }
            Routed::Matched(prefix, location) => (prefix, location),
        };
        let fs_path = resolve_path(server, prefix, location, &request.path);

        let metadata = match fs::metadata(&fs_path) {
            Ok(metadata) => metadata,
            Err(_) => {
                self.status = 404;
                return;
            }
        };
        if metadata.permissions().mode() & 0o200 == 0 {
            self.status = 403;
            return;
        }
        let removed = if metadata.is_dir() {
            if !request.path.ends_with('/') {
                self.status = 404;
                return;
            }
            fs::remove_dir(&fs_path)
        } else {
            fs::remove_file(&fs_path)
        };
        if let Err(e) = removed {
            error!("failed to remove {}: {}", fs_path, e);
            self.status = 500;
        }
    }

    fn redirect(&mut self, target: String) {
        self.status = 301;
        self.location = target;
    }

    fn serve_file(&mut self, path: &str) {
        match fs::read(path) {
            Ok(content) => {
                self.content = content;
                self.content_type = mime_type(path).to_string();
            }
            Err(e) => {
                error!("failed to read {}: {}", path, e);
                self.status = 500;
            }
        }
    }

    fn run_cgi(
        &mut self,
        interpreter: &str,
        script: &str,
        request: &Request,
        server: &ServerBlock,
        peer: IpAddr,
    ) {
        if fs::metadata(script).is_err() {
            self.status = 500;
            return;
        }
        match cgi::execute(interpreter, script, request, server, peer) {
            Ok(output) => self.apply_cgi_output(&output),
            Err(e) => {
                error!("CGI execution failed: {:#}", e);
                self.status = 500;
            }
        }
    }

    /// Fold the script's output into the response: headers up to the first
    /// blank line, everything after it as the body.
    fn apply_cgi_output(&mut self, raw: &[u8]) {
        let (head, body) = match find(b"\r\n\r\n", raw) {
            Some(end) => (&raw[..end], &raw[end + 4..]),
            None => match find(b"\n\n", raw) {
                Some(end) => (&raw[..end], &raw[end + 2..]),
                None => {
                    self.content = raw.to_vec();
                    return;
                }
            },
        };
        for line in String::from_utf8_lossy(head).lines() {
            let (name, value) = match line.find(':') {
                Some(colon) => (&line[..colon], line[colon + 1..].trim()),
                None => continue,
            };
            match name {
                "Status" => {
                    if let Ok(code) = value
                        .split(' ')
                        .next()
                        .unwrap_or("")
                        .parse::<u16>()
                    {
                        self.status = code;
                    }
                }
                "Content-Type" => self.content_type = value.to_string(),
                "Location" => self.location = value.to_string(),
                // The serialized length always reflects the actual body.
                "Content-Length" => {}
                _ => self
                    .extra_headers
                    .push((name.to_string(), value.to_string())),
            }
        }
        self.content = body.to_vec();
    }

    /// `keep-alive` survives only on a 200 response to a request that asked
    /// for it.
    fn set_connection(&mut self, request: &Request) {
        self.connection = if self.status == 200
            && request.header("Connection") == Some("keep-alive")
        {
            "keep-alive".to_string()
        } else {
            "close".to_string()
        };
    }

    fn set_error_page(&mut self, server: &ServerBlock) {
        if let Some(page) = server.error_pages.get(&self.status) {
            match fs::read(page) {
                Ok(content) => {
                    self.content = content;
                    self.content_type = mime_type(page).to_string();
                    return;
                }
                Err(e) => error!("failed to read error page {}: {}", page, e),
            }
        }
        self.content = default_error_page(self.status).into_bytes();
        self.content_type = "text/html".to_string();
    }

    /// Compose the wire form: status line, fixed headers, conditional
    /// headers, CGI passthrough headers, blank line, body.
    fn assemble(&mut self, request: &Request, server: &ServerBlock) {
        self.set_connection(request);
        if !matches!(self.status, 200 | 201 | 202 | 301) {
            self.set_error_page(server);
        }
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nServer: Webserv\r\nDate: {}\r\nContent-Length: {}\r\n",
            self.status,
            reason_phrase(self.status),
            HttpDate(Utc::now().timestamp()),
            self.content.len(),
        );
        if !self.content_type.is_empty() {
            head.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        }
        head.push_str(&format!("Connection: {}\r\n", self.connection));
        if !self.location.is_empty() {
            head.push_str(&format!("Location: {}\r\n", self.location));
        }
        for (name, value) in &self.extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        self.serialized = head.into_bytes();
        self.serialized.extend_from_slice(&self.content);
    }
}
