use vibetree_core::protocol::{ClientRequest, DaemonEvent, DaemonState};

use super::{print_done, send, unexpected};

pub fn cmd_status(args: &[String]) -> i32 {
    if !args.is_empty() {
        eprintln!("Usage: vibetree status");
        return 1;
    }
    send(ClientRequest::GetState, |event| match event {
        DaemonEvent::StateSnapshot(state) => {
            print_state(&state);
            0
        }
        _ => unexpected(),
    })
}

pub fn cmd_ping() -> i32 {
    send(ClientRequest::Ping, |event| match event {
        DaemonEvent::Pong => {
            println!("pong");
            0
        }
        _ => unexpected(),
    })
}

pub fn cmd_shutdown() -> i32 {
    send(ClientRequest::Shutdown, print_done)
}

fn print_state(state: &DaemonState) {
    println!("protocol v{}", state.protocol_version);
    println!(
        "{} repositories, {} tasks, {} terminals",
        state.repositories.len(),
        state.tasks.len(),
        state.terminals.len()
    );
    for repo in &state.repositories {
        let tasks: Vec<_> = state
            .tasks
            .iter()
            .filter(|t| t.repository_id == repo.id)
            .collect();
        println!();
        println!("{}", repo.path);
        for task in tasks {
            let terminal = state.terminals.iter().find(|t| t.task_id == task.id);
            let term = match terminal {
                Some(t) if t.attached => "attached",
                Some(_) => "running",
                None => "-",
            };
            println!("  {:<38} {:<9} {}", task.id, term, task.title);
        }
    }
}
