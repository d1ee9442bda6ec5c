//! Stand-in for a site's build and server commands in integration tests
//!
//! Usage:
//!   mock-site serve [-p PORT] [--status CODE] [--child]
//!   mock-site build
//!   mock-site fail
//!   mock-site sleep SECONDS
//!
//! `serve` falls back to the PORT environment variable. `--child` forks a
//! long-sleeping child process and writes its pid to `.sitedeploy/child.pid`
//! so tests can check that stopping a deployment takes the whole tree down.

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let code = match args.first().map(String::as_str) {
        Some("serve") => serve(&args[1..]).await,
        Some("build") => build(),
        Some("fail") => {
            eprintln!("mock-site: failing on purpose");
            1
        }
        Some("sleep") => {
            let secs = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(3600);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            0
        }
        _ => {
            eprintln!("usage: mock-site serve|build|fail|sleep");
            2
        }
    };
    std::process::exit(code);
}

fn flag_value<'a>(args: &'a [String], names: &[&str]) -> Option<&'a str> {
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn build() -> i32 {
    println!("mock-site: compiling");
    eprintln!("mock-site: writing build output");
    match std::fs::create_dir_all(".next").and_then(|_| std::fs::write(".next/BUILD_ID", "mock")) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("mock-site: build failed: {}", e);
            1
        }
    }
}

async fn serve(args: &[String]) -> i32 {
    let port: u16 = match flag_value(args, &["-p", "--port"])
        .map(str::to_string)
        .or_else(|| env::var("PORT").ok())
        .and_then(|p| p.parse().ok())
    {
        Some(port) => port,
        None => {
            eprintln!("mock-site: no port given");
            return 2;
        }
    };
    let status: u16 = flag_value(args, &["--status"])
        .and_then(|s| s.parse().ok())
        .unwrap_or(200);

    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("mock-site: failed to bind port {}: {}", port, e);
            return 1;
        }
    };
    eprintln!("mock-site: listening on port {}", port);

    // Held for the lifetime of the server
    let _child = if args.iter().any(|a| a == "--child") {
        match spawn_child() {
            Ok(child) => Some(child),
            Err(e) => {
                eprintln!("mock-site: failed to spawn child: {}", e);
                return 1;
            }
        }
    } else {
        None
    };

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(respond(stream, status));
            }
            Err(e) => eprintln!("mock-site: accept error: {}", e),
        }
    }
}

fn spawn_child() -> std::io::Result<std::process::Child> {
    let exe = env::current_exe()?;
    let child = std::process::Command::new(exe)
        .args(["sleep", "3600"])
        .stdin(std::process::Stdio::null())
        .spawn()?;
    std::fs::create_dir_all(".sitedeploy")?;
    std::fs::write(".sitedeploy/child.pid", child.id().to_string())?;
    Ok(child)
}

async fn respond(mut stream: tokio::net::TcpStream, status: u16) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    // Read request headers
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }

    let body = format!("mock-site {}\n", status);
    let response = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
