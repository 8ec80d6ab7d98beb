use vibetree_core::model::{Repository, RepositoryPatch};
use vibetree_core::protocol::{ClientRequest, DaemonEvent};

use super::{send, unexpected};

const USAGE: &str = "Usage: vibetree repo <list|add|set|remove>
  list                                   List registered repositories
  add <path> [--copy-files <list>]       Register a repository
  set <id> [--path P] [--copy-files F] [--worktree-path W] [--ai-tool T]
                                         Change repository settings (\"\" clears)
  remove <id>                            Forget a repository and all of its tasks";

pub fn cmd_repo(args: &[String]) -> i32 {
    let request = match parse(args) {
        Some(req) => req,
        None => {
            eprintln!("{USAGE}");
            return 1;
        }
    };
    send(request, |event| match event {
        DaemonEvent::RepositoryList { repositories } => {
            print_repositories(&repositories);
            0
        }
        DaemonEvent::RepositorySaved { repository } => {
            println!("{}  {}", repository.id, repository.path);
            0
        }
        DaemonEvent::RepositoryDeleted { id } => {
            println!("Removed repository {id}");
            0
        }
        _ => unexpected(),
    })
}

fn parse(args: &[String]) -> Option<ClientRequest> {
    let (sub, rest) = args.split_first()?;
    match (sub.as_str(), rest) {
        ("list", []) => Some(ClientRequest::ListRepositories),
        ("add", [path]) => Some(ClientRequest::AddRepository {
            path: path.clone(),
            copy_files: None,
        }),
        ("add", [path, flag, list]) if flag == "--copy-files" => {
            Some(ClientRequest::AddRepository {
                path: path.clone(),
                copy_files: Some(list.replace("\\n", "\n")),
            })
        }
        ("set", [id, flags @ ..]) => parse_patch(flags).map(|patch| ClientRequest::UpdateRepository {
            id: id.clone(),
            patch,
        }),
        ("remove", [id]) => Some(ClientRequest::DeleteRepository { id: id.clone() }),
        _ => None,
    }
}

fn parse_patch(flags: &[String]) -> Option<RepositoryPatch> {
    let mut patch = RepositoryPatch::default();
    for pair in flags.chunks(2) {
        let [flag, value] = pair else {
            return None;
        };
        let value = Some(value.clone());
        match flag.as_str() {
            "--path" => patch.path = value,
            "--copy-files" => patch.copy_files = value.map(|v| v.replace("\\n", "\n")),
            "--worktree-path" => patch.worktree_path = value,
            "--ai-tool" => patch.ai_tool = value,
            _ => return None,
        }
    }
    (patch != RepositoryPatch::default()).then_some(patch)
}

fn print_repositories(repositories: &[Repository]) {
    if repositories.is_empty() {
        println!("No repositories.");
        return;
    }
    for repo in repositories {
        println!("{}  {}", repo.id, repo.path);
        if let Some(tool) = &repo.ai_tool {
            println!("    ai tool: {tool}");
        }
        if let Some(base) = &repo.worktree_path {
            println!("    worktrees: {base}");
        }
        if let Some(files) = &repo.copy_files {
            println!("    copy files: {}", files.lines().collect::<Vec<_>>().join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bad_usage_returns_error() {
        assert_eq!(cmd_repo(&[]), 1);
        assert_eq!(cmd_repo(&strings(&["set", "id"])), 1);
        assert_eq!(cmd_repo(&strings(&["set", "id", "--ai-tool"])), 1);
        assert_eq!(cmd_repo(&strings(&["add"])), 1);
    }

    #[test]
    fn copy_files_accept_escaped_newlines() {
        match parse(&strings(&["add", "/r", "--copy-files", ".env\\n.env.local"])) {
            Some(ClientRequest::AddRepository { copy_files, .. }) => {
                assert_eq!(copy_files.as_deref(), Some(".env\n.env.local"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_value_is_kept_to_clear_a_setting() {
        let patch = parse_patch(&strings(&["--ai-tool", "", "--worktree-path", "/wt"])).unwrap();
        assert_eq!(patch.ai_tool.as_deref(), Some(""));
        assert_eq!(patch.worktree_path.as_deref(), Some("/wt"));
        assert!(patch.path.is_none());
    }
}
