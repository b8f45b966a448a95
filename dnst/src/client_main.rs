//! `dnstc`: the control-channel CLI client, mirroring
//! `original_source/dnst.py`. Joins argv with spaces, sends it over the
//! UNIX socket, prints whatever comes back.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const CMD_SOCKET_PATH: &str = "/tmp/nftabels.sock";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("Error: please provide arguments.");
        std::process::exit(1);
    }
    let message = args.join(" ");

    let mut stream = match UnixStream::connect(CMD_SOCKET_PATH).await {
        Ok(s) => s,
        Err(_) => {
            eprintln!("Could not connect to {CMD_SOCKET_PATH}. Is the daemon running?");
            std::process::exit(1);
        }
    };

    stream.write_all(message.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    println!("{response}");
    Ok(())
}
