#![forbid(unsafe_code)]

//! `fenix-ctl`: local CLI companion for `fenix`.
//!
//! Connects to the IPC socket and sends JSON commands to the session host.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "fenix-ctl",
    about = "Local CLI for the fenix session host",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "fenix")]
    ipc_name: String,

    /// Auth token. Falls back to `FENIX_IPC_TOKEN`, then the token file the
    /// server publishes in the temp directory.
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions.
    List,
    /// Start a session.
    Start {
        /// Session name.
        session: String,
    },
    /// Pause a session at its next wait.
    Pause {
        /// Session name.
        session: String,
    },
    /// Resume a paused session.
    Resume {
        /// Session name.
        session: String,
    },
    /// Cancel a session.
    Stop {
        /// Session name.
        session: String,
    },
    /// Cancel a session and kill its game client.
    Kill {
        /// Session name.
        session: String,
    },
}

impl Cli {
    /// Same location the server writes to.
    fn token_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}.token", self.ipc_name))
    }

    fn effective_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("FENIX_IPC_TOKEN").ok())
            .or_else(|| std::fs::read_to_string(self.token_path()).ok())
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
    }
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match &args.command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Start { session } => serde_json::json!({ "command": "start", "session": session }),
        Command::Pause { session } => serde_json::json!({ "command": "pause", "session": session }),
        Command::Resume { session } => {
            serde_json::json!({ "command": "resume", "session": session })
        }
        Command::Stop { session } => serde_json::json!({ "command": "stop", "session": session }),
        Command::Kill { session } => serde_json::json!({ "command": "kill", "session": session }),
    };
    if let (Some(token), Some(fields)) = (args.effective_token(), request_json.as_object_mut()) {
        fields.insert("auth_token".into(), serde_json::Value::String(token));
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is fenix running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
