use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use nix::unistd::{access, AccessFlags};

/// Address a `listen` directive falls back to when only a port is given.
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CLIENT_MAX_BODY_SIZE: usize = 1 << 20;

/// Methods a location accepts. Unmentioned methods are disallowed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AllowedMethods {
    pub get: bool,
    pub post: bool,
    pub delete: bool,
}

/// Routing rule for one URI prefix inside a server block.
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub allowed_methods: AllowedMethods,
    pub redirection: String,
    pub alias: String,
    pub index: String,
    pub autoindex: bool,
    pub upload: String,
    pub cgi: HashMap<String, String>,
}

/// One virtual host binding: a (host, port) endpoint plus its routing table.
#[derive(Debug, Clone)]
pub struct ServerBlock {
    pub host: u32,
    pub port: u16,
    pub ip: String,
    pub server_names: Vec<String>,
    pub root: String,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, String>,
    pub locations: HashMap<String, Location>,
    /// Listening socket serving this block, assigned during socket setup.
    pub socket: RawFd,
}

impl Default for ServerBlock {
    fn default() -> Self {
        Self {
            host: u32::from(Ipv4Addr::new(0, 0, 0, 0)),
            port: DEFAULT_PORT,
            ip: DEFAULT_HOST.to_string(),
            server_names: Vec::new(),
            root: String::new(),
            client_max_body_size: DEFAULT_CLIENT_MAX_BODY_SIZE,
            error_pages: HashMap::new(),
            locations: HashMap::new(),
            socket: -1,
        }
    }
}

/// Parse the configuration file into an ordered list of server blocks.
///
/// Any malformed token or failed validation is fatal; the caller logs the
/// error chain and exits.
pub fn parse_config(path: &str) -> Result<Vec<ServerBlock>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("unable to open file {}", path))?;
    let mut parser = Parser {
        content: content.into_bytes(),
        pos: 0,
    };
    let blocks = parser.parse()?;
    if blocks.is_empty() {
        bail!("no server block found in {}", path);
    }
    Ok(blocks)
}

/// Cursor over the raw config text.
struct Parser {
    content: Vec<u8>,
    pos: usize,
}

impl Parser {
    fn parse(&mut self) -> Result<Vec<ServerBlock>> {
        let mut blocks = Vec::new();
        loop {
            self.skip_whitespace();
            if self.at_end() {
                break;
            }
            blocks.push(self.server_block()?);
        }
        Ok(blocks)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.content.len()
    }

    fn peek(&self) -> Option<u8> {
        self.content.get(self.pos).copied()
    }

    /// Skip whitespace and `#` comments (to end of line).
    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c == b'#' {
                while !self.at_end() && self.content[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                return;
            }
        }
    }

    /// Next whitespace-delimited token.
    fn word(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() || c == b'{' || c == b';' {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.content[start..self.pos]).into_owned()
    }

    /// Everything up to the terminating `;`. Whitespace directly before the
    /// `;` is illegal.
    fn parameter(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b';' {
                if self.pos > start && self.content[self.pos - 1].is_ascii_whitespace() {
                    bail!("invalid syntax: found whitespace before ';'");
                }
                let parameter =
                    String::from_utf8_lossy(&self.content[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(parameter);
            }
            self.pos += 1;
        }
        bail!("missing ';'");
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() != Some(c) {
            bail!("missing '{}'", c as char);
        }
        self.pos += 1;
        Ok(())
    }

    fn server_block(&mut self) -> Result<ServerBlock> {
        let keyword = self.word();
        if keyword != "server" && keyword != "Server" {
            bail!("found something else than a server block: `{}'", keyword);
        }
        self.skip_whitespace();
        self.expect(b'{')?;

        let mut server = ServerBlock::default();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(server);
            }
            if self.at_end() {
                bail!("missing '}}'");
            }
            self.directive(&mut server)?;
        }
    }

    fn directive(&mut self, server: &mut ServerBlock) -> Result<()> {
        let directive = self.word();
        self.skip_whitespace();
        if directive == "location" {
            return self.location(server);
        }
        let parameter = self.parameter()?;
        let context = || format!("{} directive", directive);
        match directive.as_str() {
            "listen" => handle_listen(&parameter, server).with_context(context),
            "server_name" => handle_server_name(&parameter, server).with_context(context),
            "root" => handle_root(&parameter, server).with_context(context),
            "client_max_body_size" => {
                handle_client_max_body_size(&parameter, server).with_context(context)
            }
            "error_page" => handle_error_page(&parameter, server).with_context(context),
            _ => bail!("invalid directive in server block: `{}'", directive),
        }
    }

    fn location(&mut self, server: &mut ServerBlock) -> Result<()> {
        let prefix = self.word();
        if prefix.is_empty() {
            bail!("location directive: missing prefix");
        }
        self.skip_whitespace();
        self.expect(b'{')?;

        let mut location = Location::default();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                break;
            }
            if self.at_end() {
                bail!("missing '}}'");
            }
            let directive = self.word();
            self.skip_whitespace();
            let parameter = self.parameter()?;
            let context = || format!("{} directive", directive);
            match directive.as_str() {
                "allowed_methods" => {
                    handle_allowed_methods(&parameter, &mut location).with_context(context)?
                }
                "return" => location.redirection = parameter,
                "alias" => handle_alias(&parameter, &mut location, server).with_context(context)?,
                "autoindex" => handle_autoindex(&parameter, &mut location).with_context(context)?,
                "index" => handle_index(&parameter, &mut location, server).with_context(context)?,
                "upload" => {
                    handle_upload(&parameter, &mut location, server).with_context(context)?
                }
                "cgi" => handle_cgi(&parameter, &mut location).with_context(context)?,
                _ => bail!("invalid directive in location block: `{}'", directive),
            }
        }
        server.locations.insert(prefix, location);
        Ok(())
    }
}

/// `listen PORT` or `listen HOST:PORT`; `localhost` maps to 127.0.0.1.
fn handle_listen(parameter: &str, server: &mut ServerBlock) -> Result<()> {
    let (ip_str, port_str) = match parameter.find(':') {
        Some(i) => {
            let host = &parameter[..i];
            let host = if host == "localhost" {
                "127.0.0.1"
            } else {
                host
            };
            (host, &parameter[i + 1..])
        }
        None => (DEFAULT_HOST, parameter),
    };
    if !ip_str.bytes().all(|c| c.is_ascii_digit() || c == b'.') {
        bail!("IP invalid: `{}'", ip_str);
    }
    let addr = Ipv4Addr::from_str(ip_str).map_err(|_| anyhow!("IP invalid: `{}'", ip_str))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow!("port invalid: `{}'", port_str))?;
    if port == 0 {
        bail!("port invalid: `{}'", port_str);
    }
    server.host = u32::from(addr);
    server.port = port;
    server.ip = addr.to_string();
    Ok(())
}

/// One or more names, each restricted to `[A-Za-z0-9.~_-]`.
fn handle_server_name(parameter: &str, server: &mut ServerBlock) -> Result<()> {
    for name in parameter.split_ascii_whitespace() {
        if !name
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'~' | b'_'))
        {
            bail!("invalid character in `{}'", name);
        }
        server.server_names.push(name.to_string());
    }
    Ok(())
}

/// Trailing `/` required in the config; stored without it.
fn handle_root(parameter: &str, server: &mut ServerBlock) -> Result<()> {
    let path = require_readable_dir(parameter)?;
    server.root = path;
    Ok(())
}

fn handle_client_max_body_size(parameter: &str, server: &mut ServerBlock) -> Result<()> {
    if !parameter.bytes().all(|c| c.is_ascii_digit()) {
        bail!("invalid character in `{}'", parameter);
    }
    server.client_max_body_size = parameter
        .parse()
        .map_err(|_| anyhow!("size invalid: `{}'", parameter))?;
    Ok(())
}

/// `error_page CODE /path`: exactly three decimal digits in [100, 599], a
/// single space, then a `/`-prefixed path under the root. A later duplicate
/// code replaces the earlier mapping.
fn handle_error_page(parameter: &str, server: &mut ServerBlock) -> Result<()> {
    let bytes = parameter.as_bytes();
    if bytes.len() < 5 || !bytes[..3].iter().all(|c| c.is_ascii_digit()) {
        bail!("status code invalid: `{}'", parameter);
    }
    if bytes[3] != b' ' {
        bail!("missing space: `{}'", parameter);
    }
    if bytes[4] != b'/' {
        bail!("missing '/' in front of path: `{}'", parameter);
    }
    let code: u16 = parameter[..3]
        .parse()
        .map_err(|_| anyhow!("status code invalid: `{}'", parameter))?;
    if !(100..=599).contains(&code) {
        bail!("status code out of range: {}", code);
    }
    let page = format!("{}{}", server.root, &parameter[4..]);
    require_regular_readable(&page)?;
    server.error_pages.insert(code, page);
    Ok(())
}

fn handle_allowed_methods(parameter: &str, location: &mut Location) -> Result<()> {
    for method in parameter.split_ascii_whitespace() {
        match method {
            "GET" => location.allowed_methods.get = true,
            "POST" => location.allowed_methods.post = true,
            "DELETE" => location.allowed_methods.delete = true,
            _ => bail!("invalid method: `{}'", method),
        }
    }
    Ok(())
}

/// Alias directories are resolved relative to the root.
fn handle_alias(parameter: &str, location: &mut Location, server: &ServerBlock) -> Result<()> {
    let path = require_readable_dir(&join_root(&server.root, parameter))?;
    location.alias = path;
    Ok(())
}

fn handle_autoindex(parameter: &str, location: &mut Location) -> Result<()> {
    match parameter {
        "on" => location.autoindex = true,
        "off" => location.autoindex = false,
        _ => bail!("invalid parameter (either 'on' or 'off'): `{}'", parameter),
    }
    Ok(())
}

fn handle_index(parameter: &str, location: &mut Location, server: &ServerBlock) -> Result<()> {
    let path = join_root(&server.root, parameter);
    require_regular_readable(&path)?;
    location.index = path;
    Ok(())
}

fn handle_upload(parameter: &str, location: &mut Location, server: &ServerBlock) -> Result<()> {
    let path = join_root(&server.root, parameter);
    let metadata =
        std::fs::metadata(&path).with_context(|| format!("path invalid: `{}'", path))?;
    if !metadata.is_dir() {
        bail!("is no directory: `{}'", path);
    }
    if access(path.as_str(), AccessFlags::W_OK).is_err() {
        bail!("directory has no write rights: `{}'", path);
    }
    location.upload = path.trim_end_matches('/').to_string();
    Ok(())
}

/// `cgi EXTENSION INTERPRETER`, e.g. `cgi .py /usr/bin/python3`.
fn handle_cgi(parameter: &str, location: &mut Location) -> Result<()> {
    let mut fields = parameter.split_ascii_whitespace();
    let extension = fields.next();
    let interpreter = fields.next();
    match (extension, interpreter, fields.next()) {
        (Some(extension), Some(interpreter), None) if extension.starts_with('.') => {
            location
                .cgi
                .insert(extension.to_string(), interpreter.to_string());
            Ok(())
        }
        _ => bail!("expected `.EXTENSION INTERPRETER': `{}'", parameter),
    }
}

fn join_root(root: &str, parameter: &str) -> String {
    if parameter.starts_with('/') {
        format!("{}{}", root, parameter)
    } else {
        format!("{}/{}", root, parameter)
    }
}

/// Directory parameters must carry a trailing `/`, exist, and be readable.
/// The stored form has the trailing `/` stripped.
fn require_readable_dir(path: &str) -> Result<String> {
    if !path.ends_with('/') {
        bail!("missing '/' at end: `{}'", path);
    }
    let metadata = std::fs::metadata(path).with_context(|| format!("path invalid: `{}'", path))?;
    if !metadata.is_dir() {
        bail!("is no directory: `{}'", path);
    }
    if access(path, AccessFlags::R_OK).is_err() {
        bail!("directory has no read rights: `{}'", path);
    }
    Ok(path.trim_end_matches('/').to_string())
}

fn require_regular_readable(path: &str) -> Result<()> {
    let metadata = std::fs::metadata(path).with_context(|| format!("path invalid: `{}'", path))?;
    if !metadata.is_file() {
        bail!("is no regular file: `{}'", path);
    }
    if access(path, AccessFlags::R_OK).is_err() {
        bail!("file has no read rights: `{}'", path);
    }
    Ok(())
}
