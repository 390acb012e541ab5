use std::ffi::{CStr, CString};
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execve, fork, pipe, read, write, ForkResult};

use crate::config::ServerBlock;
use crate::request::Request;

/// CGI/1.1 environment for one request.
fn build_env(script: &str, request: &Request, server: &ServerBlock, peer: IpAddr) -> Vec<CString> {
    let entries = vec![
        "REDIRECT_STATUS=200".to_string(),
        format!(
            "CONTENT_TYPE={}",
            request.header("Content-Type").unwrap_or("")
        ),
        format!("CONTENT_LENGTH={}", request.body.len()),
        "GATEWAY_INTERFACE=CGI/1.1".to_string(),
        format!("PATH_INFO={}", request.path),
        format!("PATH_TRANSLATED={}{}", server.root, request.path),
        format!("QUERY_STRING={}", request.query),
        format!("REMOTE_HOST={}", peer),
        "REMOTE_USER=".to_string(),
        format!("REQUEST_METHOD={}", request.method.as_str()),
        format!("SCRIPT_NAME={}", script),
        format!(
            "SERVER_NAME={}",
            server.server_names.first().map(String::as_str).unwrap_or("")
        ),
        format!("SERVER_PORT={}", server.port),
        "SERVER_PROTOCOL=HTTP/1.1".to_string(),
        "SERVER_SOFTWARE=Webserv/1.0".to_string(),
    ];
    entries
        .into_iter()
        .filter_map(|entry| CString::new(entry).ok())
        .collect()
}

/// Run `interpreter script` with the request body on stdin and return the
/// child's complete stdout.
///
/// The whole server blocks for the duration of the child; pipe or fork
/// failure, exec failure and non-normal exits all surface as errors, which
/// the response builder maps to 500.
pub fn execute(
    interpreter: &str,
    script: &str,
    request: &Request,
    server: &ServerBlock,
    peer: IpAddr,
) -> Result<Vec<u8>> {
    let env = build_env(script, request, server, peer);
    let argv = vec![
        CString::new(interpreter).context("interpreter path contains NUL")?,
        CString::new(script).context("script path contains NUL")?,
    ];

    let (stdin_read, stdin_write) = pipe().context("failed to create stdin pipe")?;
    let (stdout_read, stdout_write) = pipe().context("failed to create stdout pipe")?;

    debug!("launching CGI: {} {}", interpreter, script);
    match unsafe { fork() }.context("failed to fork CGI child")? {
        ForkResult::Child => {
            let argv_ref: Vec<&CStr> = argv.iter().map(|arg| arg.as_c_str()).collect();
            let env_ref: Vec<&CStr> = env.iter().map(|entry| entry.as_c_str()).collect();
            if dup2(stdin_read, libc::STDIN_FILENO).is_err()
                || dup2(stdout_write, libc::STDOUT_FILENO).is_err()
            {
                std::process::abort();
            }
            close(stdin_write).ok();
            close(stdout_read).ok();
            let _ = execve(&argv[0], &argv_ref, &env_ref);
            // Only reached when exec failed; the parent sees the non-normal
            // exit and reports failure.
            std::process::abort();
        }
        ForkResult::Parent { child } => {
            close(stdin_read).ok();
            close(stdout_write).ok();

            let output = pump(stdin_write, stdout_read, &request.body);
            close(stdout_read).ok();

            let status = waitpid(child, None).context("failed to wait for CGI child")?;
            let output = output?;
            match status {
                WaitStatus::Exited(_, _) => Ok(output),
                status => bail!("CGI child did not exit normally: {:?}", status),
            }
        }
    }
}

/// Feed the request body to the child's stdin while collecting its stdout.
/// Both pipes are serviced from one select loop: a child that writes output
/// before draining its stdin would otherwise fill one pipe while the server
/// blocks on the other, with bodies over the pipe capacity. Closes
/// `stdin_write`; the caller closes `stdout_read`.
fn pump(stdin_write: RawFd, stdout_read: RawFd, body: &[u8]) -> Result<Vec<u8>> {
    for fd in &[stdin_write, stdout_read] {
        fcntl(*fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .context("failed to set CGI pipe nonblocking")?;
    }

    let mut remaining = body;
    let mut stdin_open = true;
    if remaining.is_empty() {
        close(stdin_write).ok();
        stdin_open = false;
    }

    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let mut read_set = FdSet::new();
        read_set.insert(stdout_read);
        let mut write_set = FdSet::new();
        if stdin_open {
            write_set.insert(stdin_write);
        }
        match select(None, Some(&mut read_set), Some(&mut write_set), None, None) {
            Ok(_) => {}
            Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Err(e) => {
                if stdin_open {
                    close(stdin_write).ok();
                }
                return Err(e).context("failed to wait on CGI pipes");
            }
        }

        if stdin_open && write_set.contains(stdin_write) {
            match write(stdin_write, remaining) {
                Ok(written) => {
                    remaining = &remaining[written..];
                    if remaining.is_empty() {
                        close(stdin_write).ok();
                        stdin_open = false;
                    }
                }
                Err(nix::Error::Sys(Errno::EAGAIN))
                | Err(nix::Error::Sys(Errno::EINTR)) => {}
                Err(_) => {
                    // Child stopped reading; it gets the body prefix only.
                    close(stdin_write).ok();
                    stdin_open = false;
                }
            }
        }

        if read_set.contains(stdout_read) {
            match read(stdout_read, &mut buf) {
                Ok(0) => break,
                Ok(received) => output.extend_from_slice(&buf[..received]),
                Err(nix::Error::Sys(Errno::EAGAIN))
                | Err(nix::Error::Sys(Errno::EINTR)) => {}
                Err(e) => {
                    if stdin_open {
                        close(stdin_write).ok();
                    }
                    return Err(e).context("failed to read CGI output");
                }
            }
        }
    }
    if stdin_open {
        close(stdin_write).ok();
    }
    Ok(output)
}
