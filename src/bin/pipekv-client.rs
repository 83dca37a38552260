use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::error;

use pipekv::{KvsClient, KvsError};

#[derive(Parser)]
#[command(
    name = "pipekv-client",
    version,
    about = "Interactive client for a pipekv server"
)]
struct Cli {
    /// Identifier used to name this client's pipes
    id: String,

    /// Server pipe name (the server listens on /tmp/server_<name>)
    server: String,

    /// Directory where the client pipes are created
    #[arg(long, default_value = "/tmp")]
    dir: PathBuf,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    let mut client = KvsClient::connect(
        &cli.server,
        cli.dir.join(format!("{}.req", cli.id)),
        cli.dir.join(format!("{}.resp", cli.id)),
        cli.dir.join(format!("{}.notif", cli.id)),
    )
    .unwrap_or_else(|e| {
        error!("failed to connect: {e}");
        exit(1);
    });
    println!("Server returned 0 for operation: CONNECT");

    let mut notifications = client
        .take_notifications()
        .expect("notifications are available right after connect");
    thread::spawn(move || {
        while let Ok(Some((key, value))) = notifications.next_record() {
            println!("({key},{value})");
        }
    });

    // Command script on stdin, one operation per line:
    //   SUBSCRIBE <key> | UNSUBSCRIBE <key> | DELAY <ms> | DISCONNECT
    let mut client = Some(client);
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("failed to read command: {e}");
                break;
            }
        };
        let mut words = line.split_whitespace();
        let (command, arg) = (words.next().unwrap_or(""), words.next());

        let outcome = match (command, arg) {
            ("", _) => continue,
            ("DELAY", Some(ms)) => match ms.parse::<u64>() {
                Ok(ms) => {
                    thread::sleep(Duration::from_millis(ms));
                    continue;
                }
                Err(_) => {
                    eprintln!("Invalid delay value");
                    continue;
                }
            },
            ("SUBSCRIBE", Some(key)) => {
                report("SUBSCRIBE", client.as_ref().expect("connected").subscribe(key))
            }
            ("UNSUBSCRIBE", Some(key)) => {
                report("UNSUBSCRIBE", client.as_ref().expect("connected").unsubscribe(key))
            }
            ("DISCONNECT", _) => {
                let outcome = report("DISCONNECT", client.take().expect("connected").disconnect());
                if let Err(e) = outcome {
                    error!("{e}");
                    exit(1);
                }
                return;
            }
            _ => {
                eprintln!("Invalid command: {line}");
                continue;
            }
        };
        if let Err(e) = outcome {
            error!("{e}");
            exit(1);
        }
    }

    // Stdin ran out without an explicit DISCONNECT.
    if let Some(client) = client {
        if let Err(e) = client.disconnect() {
            error!("failed to disconnect: {e}");
            exit(1);
        }
    }
}

fn report(operation: &str, outcome: pipekv::Result<()>) -> pipekv::Result<()> {
    match outcome {
        Ok(()) => {
            println!("Server returned 0 for operation: {operation}");
            Ok(())
        }
        Err(KvsError::Refused(_)) => {
            println!("Server returned 1 for operation: {operation}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
