use anyhow::Result;
use clap::Parser;
use ruft::transport::sender::Sender;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(version, about = "Send a file over the reliable datagram transport", long_about = None)]
#[command(after_help = "EXAMPLES: ./ruft-sender -l 127.0.0.1 --lport 9000 -r 127.0.0.1 -p 9001 -f ./data.bin")]
struct Args {
    #[arg(long, short = 'l', help = "Local IPv4 address to bind, e.g., 127.0.0.1")]
    local: Ipv4Addr,

    #[arg(long, help = "Local UDP port, e.g., 9000", default_value_t = 0)]
    lport: u16,

    #[arg(long, short = 'r', help = "Receiver IPv4 address, e.g., 127.0.0.1")]
    remote: Ipv4Addr,

    #[arg(long, short = 'p', help = "Receiver UDP port, e.g., 9001")]
    port: u16,

    #[arg(long, short = 'f', help = "Path of the file to transfer")]
    file: String,
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().init();
    let args = Args::parse();
    let mut sender = Sender::new(
        SocketAddrV4::new(args.local, args.lport),
        SocketAddrV4::new(args.remote, args.port),
    )?;
    sender.connect()?;
    println!("Connection established!");
    let start = Instant::now();
    sender.send_file(&args.file)?;
    sender.close()?;
    let stats = sender.stats();
    let elapsed = start.elapsed();
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        (stats.bytes_sent as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0
    } else {
        0.0
    };
    println!("Transfer finished!");
    println!("  elapsed:         {} ms", elapsed.as_millis());
    println!("  throughput:      {:.2} Mbps", throughput);
    println!("  bytes sent:      {}", stats.bytes_sent);
    println!("  frames sent:     {}", stats.frames_sent);
    println!("  retransmissions: {}", stats.retransmissions);
    Ok(())
}
