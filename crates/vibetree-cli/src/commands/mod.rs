pub mod attach;
pub mod config;
pub mod git;
pub mod host;
pub mod repo;
pub mod status;
pub mod task;

use vibetree_core::protocol::{ClientRequest, DaemonEvent, ErrorKind};

use crate::daemon_client;

/// Split a `--repo <path>` flag out of `args`.
pub(crate) fn take_repo_flag(args: &[String]) -> Result<(Option<String>, Vec<String>), String> {
    let mut repo = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--repo" {
            match iter.next() {
                Some(path) => repo = Some(path.clone()),
                None => return Err("--repo requires a path".to_string()),
            }
        } else if let Some(path) = arg.strip_prefix("--repo=") {
            repo = Some(path.to_string());
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((repo, rest))
}

/// Explicit flag, else the configured active repository, else the current directory.
pub(crate) fn resolve_repo(flag: Option<String>) -> Option<String> {
    flag.or_else(|| {
        let config = vibetree_core::config::load_config();
        Some(config.repo_path).filter(|p| !p.is_empty())
    })
    .or_else(|| {
        std::env::current_dir()
            .ok()
            .map(|d| d.to_string_lossy().into_owned())
    })
}

pub(crate) fn report_error(kind: ErrorKind, message: &str) -> i32 {
    eprintln!("Error: {message}");
    if kind == ErrorKind::PushRejected {
        eprintln!("The remote branch has diverged. Re-run with --force to overwrite it.");
    }
    1
}

pub(crate) fn unexpected() -> i32 {
    eprintln!("Unexpected response from daemon.");
    1
}

/// Send `req`, print errors, hand any other reply to `on_reply`.
pub(crate) fn send(req: ClientRequest, on_reply: impl FnOnce(DaemonEvent) -> i32) -> i32 {
    match daemon_client::block_on(daemon_client::request(req)) {
        Ok(DaemonEvent::Error { kind, message }) => report_error(kind, &message),
        Ok(event) => on_reply(event),
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

/// For requests answered with `Done`.
pub(crate) fn print_done(event: DaemonEvent) -> i32 {
    match event {
        DaemonEvent::Done { message } => {
            if let Some(message) = message {
                println!("{message}");
            }
            0
        }
        _ => unexpected(),
    }
}
