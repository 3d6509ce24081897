//! `framegrid-ctl`: interactive client for the front-end gateway (C7).
//!
//! Connect, read a line from stdin, send it, print whatever comes back.
//! Unlike a typical request/response REPL, the gateway can also push
//! progress events unprompted (`subtasks_info`, `tasks_info`,
//! `task_info`, `reassign_info`), so replies are read on a background
//! task instead of one-reply-per-request.

use std::io::Write as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5007".to_string());

    println!("framegrid-ctl connecting to {addr}...");
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to connect to gateway at {addr}: {e}");
            std::process::exit(1);
        }
    };
    println!("connected. Type a JSON envelope per line, or one of:");
    println!("  start           -> {{\"type\":\"start_all\"}}");
    println!("  nodes           -> {{\"type\":\"node_info\"}}");
    println!("  submit <media>  -> {{\"type\":\"create_tasks\",\"content\":{{...}}}}");
    println!("  quit            -> close the connection");

    let (read_half, mut write_half) = stream.into_split();

    let reader_task = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => println!("<- {line}"),
                Ok(None) => {
                    println!("gateway closed the connection");
                    break;
                }
                Err(e) => {
                    eprintln!("read error: {e}");
                    break;
                }
            }
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("ctl> ");
        std::io::stdout().flush().ok();

        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("quit") || command.eq_ignore_ascii_case("exit") {
            break;
        }

        let envelope = match build_envelope(command) {
            Ok(envelope) => envelope,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        if write_half.write_all(envelope.as_bytes()).await.is_err() {
            eprintln!("gateway connection lost");
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }

    drop(write_half);
    reader_task.abort();
}

/// Translates the shorthand commands into gateway envelopes; anything
/// else is passed through verbatim so a raw JSON envelope always works.
fn build_envelope(command: &str) -> Result<String, String> {
    if command.starts_with('{') {
        return Ok(command.to_string());
    }
    if command == "start" {
        return Ok(r#"{"type":"start_all"}"#.to_string());
    }
    if command == "nodes" {
        return Ok(r#"{"type":"node_info"}"#.to_string());
    }
    if let Some(media) = command.strip_prefix("submit ") {
        let job_id = uuid::Uuid::new_v4();
        return Ok(format!(
            r#"{{"type":"create_tasks","content":{{"media":"{media}","job_id":"{job_id}"}}}}"#
        ));
    }
    Err(format!("unrecognized command: {command}"))
}
