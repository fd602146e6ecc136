use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use profiler_frontend::Server;
use profiler_protocol::{Message, Tag};

/// Drives a real `Server` through one accept + request/response cycle over
/// a loopback TCP connection, exercising the `mio` accept loop, the
/// incremental frame parser, and the apartment thread end to end.
#[test]
fn request_module_metadata_round_trips_over_a_real_socket() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut server = Server::bind(addr, None).unwrap();
    let server_addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();

    let handle = thread::spawn(move || server.run());

    let mut client = connect_with_retries(server_addr);
    write_frame(&mut client, &Message::RequestModuleMetadata {
        token: 7,
        module_id: profiler_types::ModuleId(1),
    });

    let response = read_frame(&mut client);
    assert!(matches!(
        response,
        Message::ModuleMetadata { token: 7, metadata: None, .. }
    ));

    shutdown.shutdown().unwrap();
    handle.join().unwrap().unwrap();
}

fn connect_with_retries(addr: SocketAddr) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("could not connect to {addr}");
}

fn write_frame(stream: &mut TcpStream, message: &Message) {
    let tag = message.tag().as_u32();
    let payload = message.encode_payload();
    stream.write_all(&tag.to_le_bytes()).unwrap();
    stream
        .write_all(&(payload.len() as u32).to_le_bytes())
        .unwrap();
    stream.write_all(&payload).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Message {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).unwrap();
    let tag = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let length = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).unwrap();
    Message::decode(Tag::from_u32(tag).unwrap(), &payload).unwrap()
}
