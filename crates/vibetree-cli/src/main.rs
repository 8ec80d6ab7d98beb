mod commands;
mod daemon_client;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let code = run(&args);
    std::process::exit(code);
}

fn run(args: &[String]) -> i32 {
    let rest = args.get(2..).unwrap_or_default();
    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => cmd_help(),
        Some("--version") | Some("-V") => {
            println!("vibetree {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Some("task") => commands::task::cmd_task(rest),
        Some("repo") => commands::repo::cmd_repo(rest),
        Some("git") => commands::git::cmd_git(rest),
        Some("attach") => commands::attach::cmd_attach(rest),
        Some("host") => commands::host::cmd_host(rest),
        Some("config") => commands::config::cmd_config(rest),
        Some("status") => commands::status::cmd_status(rest),
        Some("ping") => commands::status::cmd_ping(),
        Some("shutdown") => commands::status::cmd_shutdown(),
        _ => {
            cmd_help();
            1
        }
    }
}

fn cmd_help() -> i32 {
    println!("vibetree {}", env!("CARGO_PKG_VERSION"));
    println!("Run AI coding tasks in their own git worktrees and terminals.");
    println!();
    println!("Usage: vibetree <command> [options]");
    println!();
    println!("Commands:");
    println!("  task                Manage tasks");
    println!("    list              List tasks for the repository");
    println!("    create <title> [description]");
    println!("                      Create a task, its worktree and terminal");
    println!("    update <id> [--title T] [--description D]");
    println!("    delete <id>       Remove a task and its worktree");
    println!("    path <id>         Print the task's worktree path");
    println!("  repo                Manage repositories");
    println!("    list | add <path> | set <id> ... | remove <id>");
    println!("  git                 Git and pull request operations");
    println!("    status | diff | commit | rebase | push | pr | sync-pr");
    println!("    default-branch | pull | merged | has-changes");
    println!("  attach <task-id>    Attach to a task's terminal (Ctrl-] detaches)");
    println!("  host                Desktop helpers");
    println!("    open | code | tools | check-code | pick-folder");
    println!("  config              Manage configuration");
    println!("    path | show | set");
    println!("  status              Show daemon state");
    println!("  ping                Check that the daemon is running");
    println!("  shutdown            Stop the daemon");
    println!();
    println!("Commands taking a repository accept --repo <path>; otherwise the");
    println!("configured repository or the current directory is used.");
    println!();
    println!("Examples:");
    println!("  vibetree task create \"Fix login\" \"The submit button does nothing\"");
    println!("  vibetree attach 0192f1c2-...");
    println!("  vibetree git push <task-id> \"wip\"");
    println!("  vibetree git pr <task-id> \"Fix login\" --base main");
    println!("  vibetree config set --ai-tool codex");
    0
}
