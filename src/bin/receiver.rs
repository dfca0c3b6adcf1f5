use anyhow::Result;
use clap::Parser;
use ruft::transport::receiver::Receiver;
use std::net::{Ipv4Addr, SocketAddrV4};

#[derive(Parser, Debug)]
#[command(version, about = "Receive a file over the reliable datagram transport", long_about = None)]
#[command(after_help = "EXAMPLES: ./ruft-receiver -b 0.0.0.0 -p 9001")]
struct Args {
    #[arg(long, short = 'b', help = "IPv4 address to bind, e.g., 0.0.0.0")]
    bind: Ipv4Addr,

    #[arg(long, short = 'p', help = "UDP port to listen on, e.g., 9001")]
    port: u16,

    #[arg(
        long,
        short = 'o',
        help = "Directory where the output file is created",
        default_value = "."
    )]
    output_dir: String,
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().init();
    let args = Args::parse();
    let mut receiver = Receiver::new(SocketAddrV4::new(args.bind, args.port), args.output_dir)?;
    let stats = receiver.run()?;
    if let Some(path) = receiver.output_path() {
        println!("Output file: {}", path.display());
    }
    println!("Receive finished!");
    println!("  bytes received:  {}", stats.bytes_received);
    println!("  frames received: {}", stats.frames_received);
    Ok(())
}
