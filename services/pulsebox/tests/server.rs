//! Request/reply tests against a live server on a loopback socket.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use pulsebox::config::Config;
use pulsebox::proto::{encode, FrameReader};
use pulsebox::seq::cmdlist;
use pulsebox::server::{Server, StopHandle};

struct StopGuard(StopHandle);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

fn read_msg(stream: &mut TcpStream, rd: &mut FrameReader) -> Vec<Vec<u8>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(parts) = rd.next().unwrap() {
            return parts;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "server closed the connection");
        rd.feed(&buf[..n]);
    }
}

fn request(
    stream: &mut TcpStream,
    rd: &mut FrameReader,
    verb: &str,
    payload: &[u8],
) -> Vec<Vec<u8>> {
    stream
        .write_all(&encode(&[verb.as_bytes(), payload]))
        .unwrap();
    read_msg(stream, rd)
}

#[test]
fn request_reply_end_to_end() {
    let dir = std::env::temp_dir().join(format!("pulsebox-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let conf = Config {
        dummy: true,
        listen: "127.0.0.1:0".into(),
        runtime_dir: dir.clone(),
        ..Config::default()
    };
    let mut server = Server::new(conf).unwrap();
    let addr = server.local_addr();
    let stop = server.stop_handle();

    let client = std::thread::spawn(move || {
        let _guard = StopGuard(stop);
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut rd = FrameReader::new();

        // state_id carries the server id we need for sequence requests.
        let parts = request(&mut stream, &mut rd, "state_id", &[]);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 16);
        let server_id = LittleEndian::read_u64(&parts[0][8..16]);

        // Clock round trip; the set is asynchronous, so poll the readback.
        assert_eq!(request(&mut stream, &mut rd, "set_clock", &[42]), [[1u8]]);
        loop {
            let clock = request(&mut stream, &mut rd, "get_clock", &[]);
            if clock == [[42u8]] {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // TTL: set bits 0 and 2, then read the override masks back.
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[4..8], 0b101);
        let parts = request(&mut stream, &mut rd, "set_ttl", &payload);
        assert_eq!(LittleEndian::read_u32(&parts[0]), 0b101);
        let parts = request(&mut stream, &mut rd, "override_ttl", &[0u8; 12]);
        assert_eq!(parts[0], [0u8; 8]);

        // DDS override, reported back by the unqueried get.
        let mut payload = [0u8; 5];
        payload[0] = pulsebox::api::pack_dds_addr(pulsebox::api::DdsType::Freq, 2);
        LittleEndian::write_u32(&mut payload[1..5], 777);
        assert_eq!(
            request(&mut stream, &mut rd, "override_dds", &payload),
            [[1u8]]
        );
        let parts = request(&mut stream, &mut rd, "get_override_dds", &[]);
        assert_eq!(parts[0].len(), 5);
        assert_eq!(parts[0][0], payload[0]);
        assert_eq!(LittleEndian::read_u32(&parts[0][1..5]), 777);

        // Run a command list; the 18-byte status reply arrives at start,
        // flushed and end.
        let mut code = Vec::new();
        cmdlist::push_wait(&mut code, 100);
        let mut payload = vec![0u8; 16];
        LittleEndian::write_u32(&mut payload[0..4], 1);
        LittleEndian::write_u64(&mut payload[4..12], 1000);
        payload.extend_from_slice(&code);
        stream
            .write_all(&encode(&[b"run_cmdlist", &payload]))
            .unwrap();
        let mut seq_id = 0;
        for _ in 0..3 {
            let parts = read_msg(&mut stream, &mut rd);
            assert_eq!(parts[0].len(), 18);
            seq_id = LittleEndian::read_u64(&parts[0][0..8]);
            assert_eq!(LittleEndian::read_u64(&parts[0][8..16]), server_id);
            // The DDS override from above is visible in the status byte.
            assert_eq!(parts[0][17], 1);
        }

        // The sequence is done, so wait_seq answers immediately.
        let mut payload = [0u8; 17];
        LittleEndian::write_u64(&mut payload[0..8], seq_id);
        LittleEndian::write_u64(&mut payload[8..16], server_id);
        payload[16] = 1;
        assert_eq!(request(&mut stream, &mut rd, "wait_seq", &payload), [[0u8]]);

        // Nothing queued, so a cancel-all has nothing to do.
        assert_eq!(request(&mut stream, &mut rd, "cancel_seq", &[]), [[0u8]]);

        // Startup script: syntax errors come back with their location.
        let parts = request(&mut stream, &mut rd, "set_startup", b"blink(0) = 1\0");
        assert_eq!(parts[0][0], 1);
        assert_eq!(LittleEndian::read_u32(&parts[0][1..5]), 1);
        let source = b"ttl(0) = 1\nwait 100\n";
        let mut payload = source.to_vec();
        payload.push(0);
        assert_eq!(
            request(&mut stream, &mut rd, "set_startup", &payload),
            [[0u8]]
        );
        let parts = request(&mut stream, &mut rd, "get_startup", &[]);
        assert_eq!(parts[0], payload);

        // Channel names.
        assert_eq!(
            request(&mut stream, &mut rd, "set_ttl_names", b"\x03cooling\0"),
            [[1u8]]
        );
        let parts = request(&mut stream, &mut rd, "get_ttl_names", &[]);
        assert_eq!(parts[0], b"\x03cooling\0");

        assert_eq!(request(&mut stream, &mut rd, "reset_dds", &[2]), [[1u8]]);

        // Unknown verbs and malformed payloads get the error byte.
        assert_eq!(request(&mut stream, &mut rd, "frobnicate", &[]), [[0xffu8]]);
        assert_eq!(
            request(&mut stream, &mut rd, "reset_dds", &[99]),
            [[0xffu8]]
        );
    });

    server.run().unwrap();
    client.join().unwrap();
    std::fs::remove_dir_all(dir).unwrap();
}
