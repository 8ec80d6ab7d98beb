use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use super::{print_done, send, unexpected};

const USAGE: &str = "Usage: vibetree host <open|code|tools|check-code|pick-folder>
  open <path>          Open a directory in the system file manager
  code <path>          Open a directory in VS Code
  tools                Show which AI CLIs are on PATH
  check-code           Is the `code` command available?
  pick-folder          Show a native folder picker";

pub fn cmd_host(args: &[String]) -> i32 {
    let request = match parse(args) {
        Some(req) => req,
        None => {
            eprintln!("{USAGE}");
            return 1;
        }
    };
    send(request, |event| match event {
        DaemonEvent::AiTools { tools } => {
            for (tool, installed) in tools {
                let mark = if installed { "installed" } else { "missing" };
                println!("{tool:<10} {mark}");
            }
            0
        }
        DaemonEvent::VsCodeStatus { installed } => {
            println!("{}", if installed { "installed" } else { "not installed" });
            0
        }
        DaemonEvent::FolderPicked { path } => match path {
            Some(path) => {
                println!("{path}");
                0
            }
            None => 1,
        },
        DaemonEvent::Done { .. } => print_done(event),
        _ => unexpected(),
    })
}

fn parse(args: &[String]) -> Option<ClientRequest> {
    let (sub, rest) = args.split_first()?;
    match (sub.as_str(), rest) {
        ("open", [path]) => Some(ClientRequest::OpenDirectory { path: path.clone() }),
        ("code", [path]) => Some(ClientRequest::OpenVsCode { path: path.clone() }),
        ("tools", []) => Some(ClientRequest::DetectAiTools),
        ("check-code", []) => Some(ClientRequest::CheckVsCode),
        ("pick-folder", []) => Some(ClientRequest::PickFolder),
        _ => None,
    }
}
