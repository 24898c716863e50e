//! Component B: Hypervisor Query.
//!
//! A narrow QMP client — line-delimited JSON over TCP — that asks for
//! exactly one thing: the guest's current kernel translation base. Modeled
//! on the teacher's own QMP clients (`src/support/qmp.rs`,
//! `crates/builder/src/builder/vm/qmp.rs`), retargeted from a Unix socket
//! to TCP per spec and narrowed to the single query this engine needs.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::{json, Value};

use crate::addr::{GuestPa, TTE_ADDR_MASK};
use crate::error::HvError;

pub struct QmpClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl QmpClient {
    /// Connects and performs the handshake (greeting + `qmp_capabilities`).
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, HvError> {
        let addr = resolve(endpoint)?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|source| HvError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|source| HvError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|source| HvError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let reader = BufReader::new(stream.try_clone().map_err(|source| HvError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?);
        let mut client = Self { stream, reader };
        client.handshake()?;
        Ok(client)
    }

    fn handshake(&mut self) -> Result<(), HvError> {
        let greeting = self.read_response()?;
        if greeting.get("QMP").is_none() {
            return Err(HvError::Protocol(format!("bad greeting: {greeting}")));
        }
        self.execute("qmp_capabilities", None)?;
        Ok(())
    }

    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, HvError> {
        let mut payload = json!({ "execute": command });
        if let Some(args) = arguments {
            payload["arguments"] = args;
        }
        let mut line = serde_json::to_vec(&payload).map_err(|e| HvError::Protocol(e.to_string()))?;
        line.push(b'\n');
        self.stream
            .write_all(&line)
            .map_err(|e| HvError::Protocol(e.to_string()))?;
        self.stream.flush().map_err(|e| HvError::Protocol(e.to_string()))?;

        loop {
            let resp = self.read_response()?;
            if let Some(err) = resp.get("error") {
                return Err(HvError::CommandFailed(err.to_string()));
            }
            if let Some(ret) = resp.get("return") {
                return Ok(ret.clone());
            }
            // Anything else is an asynchronous event; keep reading.
        }
    }

    fn read_response(&mut self) -> Result<Value, HvError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| HvError::Protocol(e.to_string()))?;
        if n == 0 {
            return Err(HvError::Protocol("connection closed by peer".to_string()));
        }
        serde_json::from_str(&line).map_err(|e| HvError::Protocol(format!("{e}: {line:?}")))
    }

    /// Issues `query-kernel-info` and extracts the kernel PGD's PA by
    /// masking the translation-base register value to a 4 KiB-aligned PA.
    pub fn query_kernel_pgd(&mut self, cpu_index: u32) -> Result<GuestPa, HvError> {
        let reply = self.execute(
            "query-kernel-info",
            Some(json!({ "cpu-index": cpu_index })),
        )?;
        let ttbr1 = reply
            .get("ttbr1")
            .and_then(Value::as_u64)
            .ok_or(HvError::MissingField("ttbr1"))?;
        Ok(GuestPa::new(ttbr1 & TTE_ADDR_MASK))
    }
}

fn resolve(endpoint: &str) -> Result<SocketAddr, HvError> {
    endpoint
        .to_socket_addrs()
        .map_err(|source| HvError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| HvError::Protocol(format!("could not resolve {endpoint}")))
}

/// Connects, queries, and tears down in one call — the only entry point
/// [`crate::facade::Introspector`] needs from this module.
pub fn query_kernel_pgd(endpoint: &str, timeout: Duration) -> Result<GuestPa, HvError> {
    let mut client = QmpClient::connect(endpoint, timeout)?;
    client.query_kernel_pgd(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    /// Spins up a trivial in-process QMP server that speaks exactly the
    /// handshake + one query this client needs, and checks the client
    /// extracts the masked PA correctly.
    #[test]
    fn handshake_and_query_extracts_masked_pa() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(b"{\"QMP\": {\"version\": {}}}\n")
                .unwrap();

            let mut buf = [0u8; 4096];
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            // qmp_capabilities
            reader.read_line(&mut String::new()).unwrap();
            stream.write_all(b"{\"return\": {}}\n").unwrap();

            // query-kernel-info
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            assert!(line.contains("query-kernel-info"));
            stream
                .write_all(b"{\"return\": {\"ttbr1\": 1234567}}\n")
                .unwrap();
            let _ = stream.read(&mut buf);
        });

        let pa = query_kernel_pgd(&addr.to_string(), Duration::from_secs(2)).unwrap();
        assert_eq!(pa, GuestPa::new(1_234_567 & TTE_ADDR_MASK));
        server.join().unwrap();
    }

    #[test]
    fn connection_refused_is_non_fatal_error() {
        // Port 1 is reserved and should refuse immediately.
        let err = query_kernel_pgd("127.0.0.1:1", Duration::from_millis(200));
        assert!(err.is_err());
    }
}
