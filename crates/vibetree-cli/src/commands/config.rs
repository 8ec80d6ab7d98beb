use vibetree_core::config::{self, AppConfig};
use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use super::{send, unexpected};

const USAGE: &str = "Usage: vibetree config <path|show|set>
  path                 Print config file path
  show                 Print the daemon's effective config
  set [--repo-path P] [--ai-tool T] [--copy-files L]
                       Update the active repository, AI tool or copy-files list";

pub fn cmd_config(args: &[String]) -> i32 {
    match args.first().map(|s| s.as_str()) {
        Some("path") if args.len() == 1 => config_path(),
        Some("show") if args.len() == 1 => send(ClientRequest::GetConfig, print_config_reply),
        Some("set") => match parse_set(&args[1..]) {
            Some(req) => send(req, print_config_reply),
            None => {
                eprintln!("{USAGE}");
                1
            }
        },
        _ => {
            eprintln!("{USAGE}");
            1
        }
    }
}

fn config_path() -> i32 {
    match config::config_path() {
        Some(p) => {
            println!("{}", p.display());
            0
        }
        None => {
            eprintln!("Cannot determine config path.");
            1
        }
    }
}

fn parse_set(flags: &[String]) -> Option<ClientRequest> {
    let mut repo_path = None;
    let mut ai_tool = None;
    let mut copy_files = None;
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        let value = iter.next()?.clone();
        match flag.as_str() {
            "--repo-path" => repo_path = Some(value),
            "--ai-tool" => ai_tool = Some(value),
            "--copy-files" => copy_files = Some(value.replace("\\n", "\n")),
            _ => return None,
        }
    }
    if repo_path.is_none() && ai_tool.is_none() && copy_files.is_none() {
        return None;
    }
    Some(ClientRequest::UpdateConfig {
        repo_path,
        ai_tool,
        copy_files,
    })
}

fn print_config_reply(event: DaemonEvent) -> i32 {
    match event {
        DaemonEvent::Config(config) => {
            print_config(&config);
            0
        }
        _ => unexpected(),
    }
}

fn print_config(config: &AppConfig) {
    let repo = if config.repo_path.is_empty() {
        "(none)"
    } else {
        &config.repo_path
    };
    println!("repo_path:  {repo}");
    println!("ai_tool:    {}", config.ai_tool);
    match &config.copy_files {
        Some(files) => println!("copy_files: {}", files.lines().collect::<Vec<_>>().join(", ")),
        None => println!("copy_files: (none)"),
    }
    println!("shell:      {}", config.shell());
    println!("buffer:     {} chunks", config.terminal.buffer_chunks);
    println!("ai delay:   {} ms", config.terminal.ai_settle_delay_ms);
}
