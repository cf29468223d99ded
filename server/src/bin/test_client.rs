//! Headless client for poking at a running server.
//!
//! Sends each command given on the command line, or each line of stdin when
//! none are given, and prints every frame the server sends back.

use clap::Parser;
use shared::protocol::{encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to connect to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port
    #[clap(short, long, default_value = "7777")]
    port: u16,
    /// Milliseconds to wait for replies after the last command
    #[clap(short, long, default_value = "500")]
    wait_ms: u64,
    /// Commands to send, e.g. `guest:alice` `room:create:Arena`
    commands: Vec<String>,
}

async fn print_replies(mut reader: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => println!("< {frame}"),
                Ok(None) => break,
                Err(e) => {
                    eprintln!("Bad frame from server: {e}");
                    return;
                }
            }
        }
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                println!("Server closed the connection");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Read failed: {e}");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    println!("Connected to {}", stream.peer_addr()?);
    let (reader, mut writer) = stream.into_split();
    let printer = tokio::spawn(print_replies(reader));

    if args.commands.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            println!("> {line}");
            writer.write_all(&encode_frame(line)).await?;
        }
    } else {
        for command in &args.commands {
            println!("> {command}");
            writer.write_all(&encode_frame(command)).await?;
        }
    }

    tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;
    writer.shutdown().await?;
    printer.abort();
    Ok(())
}
