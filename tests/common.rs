use ruft::transport::frame::Frame;
use std::fs;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

// What the proxy does with one forwarded datagram.
#[allow(dead_code)]
pub enum ProxyAction {
    Forward,
    Drop,
    // Deliver two copies.
    Duplicate,
    // Deliver these bytes instead of the original datagram.
    Replace(Vec<u8>),
}

// A UDP relay between the sender and the receiver that applies a fault
// policy to every well-formed frame passing through. `from_upstream` is true
// for frames travelling receiver -> sender. The sender must be pointed at
// the returned address.
#[allow(dead_code)]
pub fn spawn_proxy<F>(upstream: SocketAddrV4, mut policy: F) -> SocketAddrV4
where
    F: FnMut(&Frame, bool) -> ProxyAction + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind the proxy socket");
    let addr = match socket.local_addr().expect("Failed to read the proxy addr") {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!(),
    };
    socket
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("Failed to set the proxy read timeout");
    thread::spawn(move || {
        let mut downstream: Option<SocketAddr> = None;
        let mut buf = [0u8; 4096];
        loop {
            let (length, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => continue,
            };
            let from_upstream = from == SocketAddr::V4(upstream);
            if !from_upstream {
                downstream = Some(from);
            }
            let destination = if from_upstream {
                match downstream {
                    Some(addr) => addr,
                    None => continue,
                }
            } else {
                SocketAddr::V4(upstream)
            };
            let mut frame = Frame::new();
            let action = match frame.read(&buf[..length]) {
                Ok(()) => policy(&frame, from_upstream),
                Err(_) => ProxyAction::Forward,
            };
            match action {
                ProxyAction::Forward => {
                    let _ = socket.send_to(&buf[..length], destination);
                }
                ProxyAction::Drop => {}
                ProxyAction::Duplicate => {
                    let _ = socket.send_to(&buf[..length], destination);
                    let _ = socket.send_to(&buf[..length], destination);
                }
                ProxyAction::Replace(bytes) => {
                    let _ = socket.send_to(&bytes, destination);
                }
            }
        }
    });
    addr
}

// A fresh per-test directory for the input file and the receiver's sink.
#[allow(dead_code)]
pub fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ruft-test-{}-{}", std::process::id(), name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("Failed to create the test directory");
    dir
}

#[allow(dead_code)]
pub fn write_input(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("Failed to write the input file");
    path
}
