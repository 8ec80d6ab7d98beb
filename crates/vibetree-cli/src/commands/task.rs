use vibetree_core::model::Task;
use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use super::{resolve_repo, send, take_repo_flag, unexpected};

const USAGE: &str = "Usage: vibetree task <list|create|update|delete|path> [--repo <path>]
  list                              List tasks, newest first
  create <title> [description]      Create a task with its own worktree
  update <id> [--title T] [--description D]
  delete <id>                       Remove the task, its worktree and terminal
  path <id>                         Print the task's worktree path";

pub fn cmd_task(args: &[String]) -> i32 {
    let (repo_flag, args) = match take_repo_flag(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let sub = args.first().map(String::as_str);
    let rest = args.get(1..).unwrap_or_default();

    let request = match (sub, rest) {
        (Some("list"), []) => None,
        (Some("create"), [title, ..]) if rest.len() <= 2 => Some(ClientRequest::CreateTask {
            repo_path: String::new(),
            title: title.clone(),
            description: rest.get(1).cloned(),
        }),
        (Some("update"), [id, flags @ ..]) => match parse_update_flags(flags) {
            Some((title, description)) => Some(ClientRequest::UpdateTask {
                task_id: id.clone(),
                title,
                description,
            }),
            None => {
                eprintln!("{USAGE}");
                return 1;
            }
        },
        (Some("delete"), [id]) => Some(ClientRequest::DeleteTask {
            repo_path: String::new(),
            task_id: id.clone(),
        }),
        (Some("path"), [id]) => Some(ClientRequest::WorktreePath {
            repo_path: String::new(),
            task_id: id.clone(),
        }),
        _ => {
            eprintln!("{USAGE}");
            return 1;
        }
    };

    let Some(repo_path) = resolve_repo(repo_flag) else {
        eprintln!("Cannot determine repository path. Pass --repo <path>.");
        return 1;
    };
    let request = match request {
        None => ClientRequest::ListTasks { repo_path },
        Some(req) => with_repo(req, repo_path),
    };

    send(request, |event| match event {
        DaemonEvent::TaskList { tasks } => {
            print_tasks(&tasks);
            0
        }
        DaemonEvent::TaskCreated { task } => {
            println!("Created task {}", task.id);
            println!("  branch: {}", task.branch_name);
            0
        }
        DaemonEvent::TaskUpdated { task } => {
            println!("Updated task {}", task.id);
            0
        }
        DaemonEvent::TaskDeleted { task_id } => {
            println!("Deleted task {task_id}");
            0
        }
        DaemonEvent::WorktreePath { path } => {
            println!("{path}");
            0
        }
        _ => unexpected(),
    })
}

fn with_repo(req: ClientRequest, repo: String) -> ClientRequest {
    match req {
        ClientRequest::CreateTask {
            title, description, ..
        } => ClientRequest::CreateTask {
            repo_path: repo,
            title,
            description,
        },
        ClientRequest::DeleteTask { task_id, .. } => ClientRequest::DeleteTask {
            repo_path: repo,
            task_id,
        },
        ClientRequest::WorktreePath { task_id, .. } => ClientRequest::WorktreePath {
            repo_path: repo,
            task_id,
        },
        other => other,
    }
}

type UpdateFields = (Option<String>, Option<String>);

fn parse_update_flags(flags: &[String]) -> Option<UpdateFields> {
    let mut title = None;
    let mut description = None;
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--title" => title = Some(iter.next()?.clone()),
            "--description" => description = Some(iter.next()?.clone()),
            _ => return None,
        }
    }
    if title.is_none() && description.is_none() {
        return None;
    }
    Some((title, description))
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks.");
        return;
    }
    println!("{:<38} {:<27} {:<6} TITLE", "ID", "BRANCH", "PR");
    println!("{}", "-".repeat(90));
    for task in tasks {
        let pr = match (&task.pr_url, task.pr_merged) {
            (None, _) => "-",
            (Some(_), Some(true)) => "merged",
            (Some(_), _) => "open",
        };
        let title: String = task.title.replace('\n', " ").chars().take(40).collect();
        println!("{:<38} {:<27} {:<6} {}", task.id, task.branch_name, pr, title);
    }
}
