//! One-shot HTTP responder for exercising the blocking clients.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;

/// Serves a single request with `status` and a JSON `body`, then returns
/// the raw request text from the join handle.
pub(crate) fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = match TcpListener::bind("127.0.0.1:0") {
        Ok(value) => value,
        Err(err) => panic!("failed to bind stub server: {err}"),
    };
    let address = match listener.local_addr() {
        Ok(value) => value,
        Err(err) => panic!("failed to read stub address: {err}"),
    };

    let handle = std::thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(value) => value,
            Err(err) => panic!("stub accept failed: {err}"),
        };

        let mut received = Vec::new();
        let mut buffer = [0_u8; 4096];
        loop {
            let read = match stream.read(&mut buffer) {
                Ok(value) => value,
                Err(err) => panic!("stub read failed: {err}"),
            };
            if read == 0 {
                break;
            }
            received.extend_from_slice(&buffer[..read]);
            if request_complete(&received) {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        if let Err(err) = stream.write_all(response.as_bytes()) {
            panic!("stub write failed: {err}");
        }

        String::from_utf8_lossy(&received).into_owned()
    });

    (format!("http://{address}"), handle)
}

fn request_complete(received: &[u8]) -> bool {
    let text = String::from_utf8_lossy(received);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };

    let content_length = text[..header_end]
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    received.len() >= header_end + 4 + content_length
}
