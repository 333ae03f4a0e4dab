//! Replica orchestrator: binds N state machine replicas on consecutive ports
//! and injects simulated failures from stdin. In TEST mode every replica
//! appends its executed requests to `test_log_<port>.txt`.

use lockstep::{Replica, ReplicaConfig, BASE_PORT};
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;

fn usage() -> ! {
    println!("Usage: servers <# of server replicas>");
    println!("Testing Usage: servers <# of server replicas> TEST");
    std::process::exit(1);
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let mut args = pico_args::Arguments::from_env();
    let count_arg: String = match args.opt_free_from_str() {
        Ok(Some(arg)) => arg,
        _ => usage(),
    };
    let test_arg: Option<String> = args.opt_free_from_str().unwrap_or(None);
    if !args.finish().is_empty() {
        usage();
    }

    let count: usize = match count_arg.parse() {
        Ok(count) if count > 0 => count,
        _ => {
            println!("# of server replicas must be a positive integer!");
            std::process::exit(1);
        }
    };
    let test_mode = match test_arg.as_deref() {
        None => false,
        Some("TEST") => true,
        Some(_) => {
            println!("Did you actually mean to test?");
            usage();
        }
    };

    let test_log_dir = if test_mode {
        Some(std::env::current_dir().unwrap_or_else(|_| ".".into()))
    } else {
        None
    };

    let mut replicas = Vec::with_capacity(count);
    for index in 0..count {
        let port = BASE_PORT + index as u16;
        let config = ReplicaConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            test_log_dir: test_log_dir.clone(),
        };
        match Replica::spawn(config) {
            Ok(replica) => replicas.push(replica),
            Err(e) => {
                eprintln!("Unable to bind replica {index} on port {port}: {e}");
                std::process::exit(1);
            }
        }
    }
    println!(
        "{} state machine replicas initialized at {}.",
        count,
        replicas
            .iter()
            .map(|replica| replica.local_addr().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // Failure injection loop, capped at N - 1 so at least one replica
    // survives.
    let stdin = io::stdin();
    let mut failed: HashSet<usize> = HashSet::new();
    let mut prompt = "Enter the index of a SM to disable: ".to_owned();
    let mut stdin_open = true;
    while stdin_open && failed.len() + 1 < count {
        print!("{prompt}");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                stdin_open = false;
                continue;
            }
            Ok(_) => {}
        }

        let index = match line.trim().parse::<usize>() {
            Err(_) => {
                prompt = "Index must be a nonnegative integer: ".to_owned();
                continue;
            }
            Ok(index) if index >= count => {
                prompt = format!("Please enter a valid index ([0, {}]): ", count - 1);
                continue;
            }
            Ok(index) if failed.contains(&index) => {
                prompt =
                    format!("Replica {index} has already failed. Enter a different SM index: ");
                continue;
            }
            Ok(index) => index,
        };

        replicas[index].inject_failure();
        failed.insert(index);
        prompt = "Enter the index of a SM to disable: ".to_owned();
    }
    if failed.len() + 1 >= count {
        println!("Maximum fault tolerance achieved.");
    }

    // Keep serving on the surviving replicas until the process is killed.
    loop {
        std::thread::park();
    }
}
