//! Remote fuzzer RPC client.
//!
//! The engine only depends on the call shape
//! `get_mutation(stage, session_data) -> bytes | None`; the transport here is
//! one JSON object per line over a TCP stream, with byte values hex-encoded.
//! A request that fails for any reason degrades to "no mutation" so an
//! unreachable fuzzer never perturbs emulation.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fuzz::{MutationSource, SessionData};
use crate::{Error, Result};

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: RpcParams<'a>,
}

#[derive(Serialize)]
struct RpcParams<'a> {
    stage: &'a str,
    data: BTreeMap<&'a str, String>,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
}

/// Blocking RPC client for the external mutation service.
pub struct FuzzerClient {
    conn: Mutex<Connection>,
}

impl FuzzerClient {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| Error::Fuzzer(format!("cannot reach fuzzer at {host}:{port}: {e}")))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .map_err(Error::Transport)?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| Error::Fuzzer(format!("cannot clone fuzzer stream: {e}")))?,
        );
        log::info!("connected to fuzzer at {host}:{port}");
        Ok(Self {
            conn: Mutex::new(Connection {
                reader,
                writer: stream,
                next_id: 1,
            }),
        })
    }

    fn call(&self, stage: &str, data: &SessionData) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.lock().unwrap();
        let id = conn.next_id;
        conn.next_id += 1;

        let params = RpcParams {
            stage,
            data: data
                .iter()
                .map(|(k, v)| (k.as_str(), hex_encode(v)))
                .collect(),
        };
        let request = RpcRequest {
            id,
            method: "get_mutation",
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| Error::Fuzzer(format!("encode request: {e}")))?;
        line.push('\n');
        conn.writer.write_all(line.as_bytes())?;

        let mut reply = String::new();
        conn.reader.read_line(&mut reply)?;
        if reply.is_empty() {
            return Err(Error::Fuzzer("fuzzer closed the connection".into()));
        }
        let response: RpcResponse = serde_json::from_str(reply.trim_end())
            .map_err(|e| Error::Fuzzer(format!("decode response: {e}")))?;
        if response.id != id {
            return Err(Error::Fuzzer(format!(
                "response id mismatch: sent {id}, got {}",
                response.id
            )));
        }
        if let Some(err) = response.error {
            return Err(Error::Fuzzer(err));
        }
        match response.result {
            None => Ok(None),
            Some(hex) => Ok(Some(hex_decode(&hex)?)),
        }
    }
}

impl MutationSource for FuzzerClient {
    fn get_mutation(&self, stage: &str, data: &SessionData) -> Option<Vec<u8>> {
        match self.call(stage, data) {
            Ok(mutation) => mutation,
            Err(e) => {
                log::warn!("fuzzer unavailable for stage {stage}: {e}");
                None
            }
        }
    }
}

fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Fuzzer(format!("odd-length hex string: {s:?}")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| Error::Fuzzer(format!("bad hex byte in mutation: {e}")))
        })
        .collect()
}
