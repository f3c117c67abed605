//! Test support: a scripted in-process mock collector.
//!
//! Records every request (method, path, headers, body) and answers with a
//! scripted status sequence; once the script is exhausted the last status
//! repeats. Responses carry `Connection: close` so each request arrives on
//! its own connection.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body should be JSON")
    }
}

pub struct MockCollector {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockCollector {
    /// Answer every request with 200.
    pub fn start() -> Self {
        Self::with_statuses(Vec::new())
    }

    /// Answer with the scripted statuses in order, repeating the last one
    /// (or 200 for an empty script) once exhausted.
    pub fn with_statuses(script: Vec<u16>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock collector");
        let addr = listener.local_addr().expect("local addr");
        let requests: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let statuses: Arc<Mutex<VecDeque<u16>>> =
            Arc::new(Mutex::new(script.into_iter().collect()));

        let thread_requests = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let requests = Arc::clone(&thread_requests);
                let statuses = Arc::clone(&statuses);
                thread::spawn(move || {
                    let _ = handle_connection(stream, &requests, &statuses);
                });
            }
        });

        MockCollector { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Poll until at least `n` requests arrived or the timeout elapses.
    pub fn wait_for_hits(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.hits() >= n {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        self.hits() >= n
    }
}

fn handle_connection(
    stream: TcpStream,
    requests: &Mutex<Vec<ReceivedRequest>>,
    statuses: &Mutex<VecDeque<u16>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
            headers.push((name, value));
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    requests.lock().unwrap().push(ReceivedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    let status = {
        let mut script = statuses.lock().unwrap();
        match script.len() {
            0 => 200,
            1 => *script.front().unwrap(),
            _ => script.pop_front().unwrap(),
        }
    };
    let reason = match status {
        200 => "OK",
        202 => "Accepted",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        _ => "Status",
    };
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    )?;
    stream.flush()?;
    Ok(())
}

/// Serializes tests that touch the global façade.
pub fn facade_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Poll `predicate` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    predicate()
}
