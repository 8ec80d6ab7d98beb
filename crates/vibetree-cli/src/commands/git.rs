use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use super::{print_done, resolve_repo, send, take_repo_flag, unexpected};

const USAGE: &str = "Usage: vibetree git <command> [--repo <path>]
  status [task]                        Branch and short status
  diff [task]                          Unstaged diff
  commit <message> [--task <id>]       Stage everything and commit
  rebase <task> <base>                 Rebase the task branch onto <base>
  push <task> [message] [--force]      Commit if needed and push the task branch
  pr <task> <title> [--body B] [--base BRANCH]
                                       Push and open a pull request
  sync-pr <task>                       Rewrite the PR title/body with the AI tool
  default-branch                       Print the remote default branch
  pull                                 Update the local default branch
  merged <task>                        Check whether the task's PR is merged
  has-changes <task>                   Anything to open a PR with?";

pub fn cmd_git(args: &[String]) -> i32 {
    let (repo_flag, args) = match take_repo_flag(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let Some(build) = parse(&args) else {
        eprintln!("{USAGE}");
        return 1;
    };
    let Some(repo_path) = resolve_repo(repo_flag) else {
        eprintln!("Cannot determine repository path. Pass --repo <path>.");
        return 1;
    };
    send(build(repo_path), print_git_reply)
}

type Build = Box<dyn FnOnce(String) -> ClientRequest>;

/// Pull `--name value` flags out of `args`; bare `--force` becomes `("--force", "")`.
fn split_flags(args: &[String]) -> Option<(Vec<String>, Vec<(String, String)>)> {
    let mut positional = Vec::new();
    let mut flags = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--force" {
            flags.push((arg.clone(), String::new()));
        } else if arg.starts_with("--") {
            flags.push((arg.clone(), iter.next()?.clone()));
        } else {
            positional.push(arg.clone());
        }
    }
    Some((positional, flags))
}

fn flag<'a>(flags: &'a [(String, String)], name: &str) -> Option<&'a str> {
    flags
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn parse(args: &[String]) -> Option<Build> {
    let (positional, flags) = split_flags(args)?;
    let known = ["--task", "--force", "--body", "--base"];
    if flags.iter().any(|(n, _)| !known.contains(&n.as_str())) {
        return None;
    }
    let force = flag(&flags, "--force").is_some();
    let body = flag(&flags, "--body").map(str::to_string);
    let base = flag(&flags, "--base").map(str::to_string);
    let flag_task = flag(&flags, "--task").map(str::to_string);

    let (sub, rest) = positional.split_first()?;
    let build: Build = match (sub.as_str(), rest) {
        ("status", [] | [_]) => {
            let task_id = rest.first().cloned();
            Box::new(move |repo_path| ClientRequest::GitStatus { repo_path, task_id })
        }
        ("diff", [] | [_]) => {
            let task_id = rest.first().cloned();
            Box::new(move |repo_path| ClientRequest::GitDiff { repo_path, task_id })
        }
        ("commit", [message]) => {
            let message = message.clone();
            Box::new(move |repo_path| ClientRequest::GitCommit {
                repo_path,
                task_id: flag_task,
                message,
            })
        }
        ("rebase", [task_id, base_branch]) => {
            let (task_id, base_branch) = (task_id.clone(), base_branch.clone());
            Box::new(move |repo_path| ClientRequest::Rebase {
                repo_path,
                task_id,
                base_branch,
            })
        }
        ("push", [task_id, message @ ..]) if message.len() <= 1 => {
            let task_id = task_id.clone();
            let commit_message = message.first().cloned().unwrap_or_default();
            Box::new(move |repo_path| {
                if force {
                    ClientRequest::ForcePush {
                        repo_path,
                        task_id,
                        commit_message,
                    }
                } else {
                    ClientRequest::Push {
                        repo_path,
                        task_id,
                        commit_message,
                    }
                }
            })
        }
        ("pr", [task_id, title]) => {
            let (task_id, title) = (task_id.clone(), title.clone());
            let base_branch = base.unwrap_or_else(|| "main".to_string());
            Box::new(move |repo_path| ClientRequest::CreatePr {
                repo_path,
                task_id,
                title,
                body,
                base_branch,
            })
        }
        ("sync-pr", [task_id]) => {
            let task_id = task_id.clone();
            Box::new(move |repo_path| ClientRequest::SyncPrWithAi { repo_path, task_id })
        }
        ("default-branch", []) => Box::new(|repo_path| ClientRequest::DefaultBranch { repo_path }),
        ("pull", []) => Box::new(|repo_path| ClientRequest::PullMainBranch { repo_path }),
        ("merged", [task_id]) => {
            let task_id = task_id.clone();
            Box::new(move |repo_path| ClientRequest::CheckPrMergeStatus { repo_path, task_id })
        }
        ("has-changes", [task_id]) => {
            let task_id = task_id.clone();
            Box::new(move |repo_path| ClientRequest::HasChangesForPr { repo_path, task_id })
        }
        _ => return None,
    };
    Some(build)
}

fn print_git_reply(event: DaemonEvent) -> i32 {
    match event {
        DaemonEvent::GitStatus { branch, status } => {
            println!("On branch {branch}");
            if status.is_empty() {
                println!("nothing to commit, working tree clean");
            } else {
                println!("{status}");
            }
            0
        }
        DaemonEvent::GitDiff { diff } => {
            println!("{diff}");
            0
        }
        DaemonEvent::PrCreated { url } => {
            match url {
                Some(url) => println!("{url}"),
                None => println!("Pull request created."),
            }
            0
        }
        DaemonEvent::DefaultBranch { branch } => {
            println!("{branch}");
            0
        }
        DaemonEvent::PrMergeStatus { merged } => {
            println!("{}", if merged { "merged" } else { "not merged" });
            0
        }
        DaemonEvent::HasChanges { has_changes } => {
            println!("{}", if has_changes { "yes" } else { "no" });
            0
        }
        DaemonEvent::Done { .. } => print_done(event),
        _ => unexpected(),
    }
}
