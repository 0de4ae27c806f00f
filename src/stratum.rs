// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Stratum V1 client: line-delimited JSON-RPC over TCP. The client
//! runs the handshake whole, then splits into a receive half for the
//! pool's notification stream and a submit half for shares, so the
//! pipeline can drive them from separate tasks.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{self, ErrorKind};
use crate::job::Job;
use crate::work::JobTemplate;
use crate::{info, warn};

/// Full BIP320 mask requested through `mining.configure`
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// Something the pool told us, ready for the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PoolMessage {
    Notify(JobTemplate),
    SetDifficulty(u32),
    SetVersionMask(u32),
    /// Outcome of one of our submits, matched by request id
    SubmitResult { id: u64, accepted: bool },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShareStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// One JSON-RPC line in either direction
#[derive(Debug, Deserialize)]
struct Rpc {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

/// State both halves touch: submit ids waiting for a verdict and the
/// running share counters
#[derive(Default)]
struct Shared {
    pending_submits: Mutex<HashSet<u64>>,
    stats: Mutex<ShareStats>,
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    user: String,
    /// Notifications that arrived while waiting for a call response
    queued: Vec<PoolMessage>,
    shared: Arc<Shared>,
    pub extranonce1: String,
    pub extranonce2_size: usize,
    /// Mask the pool negotiated, zero when rolling was refused
    pub version_mask: u32,
}

impl Client {
    pub async fn connect(url: &str, user: &str) -> error::Result<Self> {
        info!("stratum: connecting to {}", url);
        let stream = TcpStream::connect(url)
            .await
            .map_err(|e| ErrorKind::Stratum(format!("connect to {}: {}", url, e)))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 0,
            user: user.to_string(),
            queued: Vec::new(),
            shared: Arc::new(Shared::default()),
            extranonce1: String::new(),
            extranonce2_size: 0,
            version_mask: 0,
        })
    }

    /// Subscribe, negotiate version rolling, authorize and suggest the
    /// initial difficulty, in the order pools expect.
    pub async fn handshake(&mut self, password: &str, difficulty: u32) -> error::Result<()> {
        let result = self.call("mining.subscribe", json!([])).await?;
        let fields = result
            .as_array()
            .ok_or_else(|| ErrorKind::Stratum("subscribe result is not an array".to_string()))?;
        self.extranonce1 = fields
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| ErrorKind::Stratum("subscribe result lacks extranonce1".to_string()))?
            .to_string();
        self.extranonce2_size = fields
            .get(2)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ErrorKind::Stratum("subscribe result lacks extranonce2 size".to_string())
            })? as usize;
        info!(
            "stratum: extranonce1 {}, extranonce2 size {}",
            self.extranonce1, self.extranonce2_size
        );

        let result = self
            .call(
                "mining.configure",
                json!([
                    ["version-rolling"],
                    { "version-rolling.mask": format!("{:08x}", VERSION_ROLLING_MASK) }
                ]),
            )
            .await?;
        self.version_mask = match result.get("version-rolling.mask").and_then(Value::as_str) {
            Some(mask) => hex_u32(mask)?,
            None => {
                warn!("stratum: pool refused version rolling");
                0
            }
        };
        info!("stratum: negotiated version mask {:08x}", self.version_mask);

        let user = self.user.clone();
        let result = self
            .call("mining.authorize", json!([user, password]))
            .await?;
        if result.as_bool() != Some(true) {
            Err(ErrorKind::Stratum(format!(
                "authorization refused for {}",
                self.user
            )))?;
        }

        self.next_id += 1;
        send_request(
            &mut self.writer,
            self.next_id,
            "mining.suggest_difficulty",
            json!([difficulty]),
        )
        .await?;
        Ok(())
    }

    /// Hand the connection over to the pipeline as two independently
    /// owned halves
    pub fn split(self) -> (Receiver, Submitter) {
        let receiver = Receiver {
            reader: self.reader,
            queued: self.queued,
            shared: self.shared.clone(),
        };
        let submitter = Submitter {
            writer: self.writer,
            next_id: self.next_id,
            user: self.user,
            shared: self.shared,
        };
        (receiver, submitter)
    }

    /// Send a request and consume inbound lines until its response
    /// shows up; notifications seen on the way are queued.
    async fn call(&mut self, method: &str, params: Value) -> error::Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        send_request(&mut self.writer, id, method, params).await?;
        loop {
            let rpc = read_rpc(&mut self.reader).await?;
            if rpc.method.is_none() && rpc.id == Some(id) {
                if let Some(error) = &rpc.error {
                    if !error.is_null() {
                        Err(ErrorKind::Stratum(format!("{} failed: {}", method, error)))?;
                    }
                }
                return Ok(rpc.result.unwrap_or(Value::Null));
            }
            if let Some(message) = dispatch(rpc, &self.shared)? {
                self.queued.push(message);
            }
        }
    }
}

/// Read half: the pool's notification stream plus submit verdicts
pub struct Receiver {
    reader: BufReader<OwnedReadHalf>,
    queued: Vec<PoolMessage>,
    shared: Arc<Shared>,
}

impl Receiver {
    /// Next message from the pool. Submit verdicts update the share
    /// counters before being handed out.
    pub async fn next_message(&mut self) -> error::Result<PoolMessage> {
        if !self.queued.is_empty() {
            return Ok(self.queued.remove(0));
        }
        loop {
            let rpc = read_rpc(&mut self.reader).await?;
            if let Some(message) = dispatch(rpc, &self.shared)? {
                return Ok(message);
            }
        }
    }

    pub fn stats(&self) -> ShareStats {
        *self.shared.stats.lock().expect("stats lock")
    }
}

/// Write half: share submission
pub struct Submitter {
    writer: OwnedWriteHalf,
    next_id: u64,
    user: String,
    shared: Arc<Shared>,
}

impl Submitter {
    /// Submit a solved share. The verdict arrives on the read half as
    /// a `SubmitResult` carrying the returned id.
    pub async fn submit(&mut self, job: &Job, nonce: u32, version: u32) -> error::Result<u64> {
        let params = json!([
            self.user,
            job.pool_job_id,
            job.extranonce2,
            format!("{:08x}", job.ntime),
            format!("{:08x}", nonce),
            format!("{:08x}", version),
        ]);
        self.next_id += 1;
        let id = self.next_id;
        self.shared
            .pending_submits
            .lock()
            .expect("pending lock")
            .insert(id);
        send_request(&mut self.writer, id, "mining.submit", params).await?;
        Ok(id)
    }
}

async fn send_request(
    writer: &mut OwnedWriteHalf,
    id: u64,
    method: &str,
    params: Value,
) -> error::Result<()> {
    let line = format!(
        "{}\n",
        json!({ "id": id, "method": method, "params": params })
    );
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ErrorKind::Stratum(format!("send {}: {}", method, e)))?;
    Ok(())
}

async fn read_rpc(reader: &mut BufReader<OwnedReadHalf>) -> error::Result<Rpc> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|e| ErrorKind::Stratum(format!("socket read: {}", e)))?;
    if read == 0 {
        Err(ErrorKind::Stratum("connection closed by pool".to_string()))?;
    }
    parse_rpc(&line)
}

/// Sort one inbound line into a `PoolMessage`, or `None` for lines we
/// do not track (e.g. suggest_difficulty acks)
fn dispatch(rpc: Rpc, shared: &Shared) -> error::Result<Option<PoolMessage>> {
    if let (Some(method), Some(params)) = (&rpc.method, &rpc.params) {
        return match parse_notification(method, params) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!("stratum: ignoring {}: {}", method, e);
                Ok(None)
            }
        };
    }
    if let Some(id) = rpc.id {
        if shared
            .pending_submits
            .lock()
            .expect("pending lock")
            .remove(&id)
        {
            let accepted = rpc.result.as_ref().and_then(Value::as_bool) == Some(true)
                && rpc.error.as_ref().map_or(true, Value::is_null);
            let mut stats = shared.stats.lock().expect("stats lock");
            if accepted {
                stats.accepted += 1;
            } else {
                stats.rejected += 1;
                warn!("stratum: share {} rejected: {:?}", id, rpc.error);
            }
            return Ok(Some(PoolMessage::SubmitResult { id, accepted }));
        }
    }
    Ok(None)
}

fn parse_rpc(line: &str) -> error::Result<Rpc> {
    serde_json::from_str(line)
        .map_err(|e| ErrorKind::Stratum(format!("malformed line {:?}: {}", line.trim(), e)).into())
}

fn hex_u32(field: &str) -> error::Result<u32> {
    u32::from_str_radix(field, 16)
        .map_err(|e| ErrorKind::Stratum(format!("bad hex field {:?}: {}", field, e)).into())
}

fn parse_notification(method: &str, params: &Value) -> error::Result<PoolMessage> {
    match method {
        "mining.notify" => Ok(PoolMessage::Notify(parse_notify(params)?)),
        "mining.set_difficulty" => {
            let difficulty = params
                .get(0)
                .and_then(Value::as_f64)
                .ok_or_else(|| ErrorKind::Stratum("set_difficulty without value".to_string()))?;
            Ok(PoolMessage::SetDifficulty(difficulty.max(1.0) as u32))
        }
        "mining.set_version_mask" => {
            let mask = params
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| ErrorKind::Stratum("set_version_mask without mask".to_string()))?;
            Ok(PoolMessage::SetVersionMask(hex_u32(mask)?))
        }
        other => Err(ErrorKind::Stratum(format!("unknown method {}", other)).into()),
    }
}

fn parse_notify(params: &Value) -> error::Result<JobTemplate> {
    let str_field = |idx: usize| -> error::Result<String> {
        params
            .get(idx)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ErrorKind::Stratum(format!("notify param {} missing or not a string", idx)).into()
            })
    };
    let branches = params
        .get(4)
        .and_then(Value::as_array)
        .ok_or_else(|| ErrorKind::Stratum("notify merkle branches missing".to_string()))?
        .iter()
        .map(|branch| {
            branch.as_str().map(str::to_string).ok_or_else(|| {
                ErrorKind::Stratum("merkle branch is not a string".to_string()).into()
            })
        })
        .collect::<error::Result<Vec<String>>>()?;
    // some pools pad extra params before the trailing clean_jobs flag
    let clean_jobs = params
        .as_array()
        .and_then(|p| p.last())
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(JobTemplate {
        job_id: str_field(0)?,
        prev_hash: str_field(1)?,
        coinbase1: str_field(2)?,
        coinbase2: str_field(3)?,
        merkle_branches: branches,
        version: hex_u32(&str_field(5)?)?,
        nbits: hex_u32(&str_field(6)?)?,
        ntime: hex_u32(&str_field(7)?)?,
        clean_jobs,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const NOTIFY: &str = r#"{"id":null,"method":"mining.notify","params":["1d2e0c4d3d","ef4b9a48c7986466de4adc002f7337a6e121bc43000376ea0000000000000000","0100000001","41903d4c1b",["ae23055e00f0f697cc3640124812d96d4fe8bdfa03484c1c638ce5a1c0e9aa81"],"20000004","1705c739","64495522",false]}"#;

    #[test]
    fn test_parse_notify() {
        let rpc = parse_rpc(NOTIFY).unwrap();
        let message =
            parse_notification(&rpc.method.unwrap(), &rpc.params.unwrap()).unwrap();
        let template = match message {
            PoolMessage::Notify(template) => template,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(template.job_id, "1d2e0c4d3d");
        assert_eq!(
            template.prev_hash,
            "ef4b9a48c7986466de4adc002f7337a6e121bc43000376ea0000000000000000"
        );
        assert_eq!(template.merkle_branches.len(), 1);
        assert_eq!(template.version, 0x20000004);
        assert_eq!(template.nbits, 0x1705c739);
        assert_eq!(template.ntime, 0x64495522);
        assert!(!template.clean_jobs);
    }

    #[test]
    fn test_parse_notify_with_padded_params() {
        // 9-element params, clean_jobs still the trailing bool
        let line = NOTIFY.replace(r#""64495522",false"#, r#""64495522","64495522",true"#);
        let rpc = parse_rpc(&line).unwrap();
        let message =
            parse_notification(&rpc.method.unwrap(), &rpc.params.unwrap()).unwrap();
        match message {
            PoolMessage::Notify(template) => assert!(template.clean_jobs),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_set_difficulty() {
        let rpc =
            parse_rpc(r#"{"id":null,"method":"mining.set_difficulty","params":[1638]}"#).unwrap();
        let message =
            parse_notification(&rpc.method.unwrap(), &rpc.params.unwrap()).unwrap();
        assert_eq!(message, PoolMessage::SetDifficulty(1638));
    }

    #[test]
    fn test_parse_set_version_mask() {
        let rpc = parse_rpc(r#"{"id":1,"method":"mining.set_version_mask","params":["1fffe000"]}"#)
            .unwrap();
        let message =
            parse_notification(&rpc.method.unwrap(), &rpc.params.unwrap()).unwrap();
        assert_eq!(message, PoolMessage::SetVersionMask(0x1fffe000));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(parse_rpc("not json\n").is_err());
        let rpc = parse_rpc(r#"{"id":null,"method":"mining.notify","params":["x"]}"#).unwrap();
        assert!(parse_notification(&rpc.method.unwrap(), &rpc.params.unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_handshake_and_submit_accounting() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let pool = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut requests = Vec::new();

            // subscribe
            let line = lines.next_line().await.unwrap().unwrap();
            requests.push(line.clone());
            let rpc: Value = serde_json::from_str(&line).unwrap();
            let id = rpc["id"].as_u64().unwrap();
            let reply = format!(
                "{}\n",
                json!({ "id": id, "result": [[], "e9695791", 4], "error": null })
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();

            // configure, with a notify injected before the response
            let line = lines.next_line().await.unwrap().unwrap();
            requests.push(line.clone());
            let rpc: Value = serde_json::from_str(&line).unwrap();
            let id = rpc["id"].as_u64().unwrap();
            write_half
                .write_all(format!("{}\n", NOTIFY).as_bytes())
                .await
                .unwrap();
            let reply = format!(
                "{}\n",
                json!({
                    "id": id,
                    "result": { "version-rolling": true, "version-rolling.mask": "1fffe000" },
                    "error": null
                })
            );
            write_half.write_all(reply.as_bytes()).await.unwrap();

            // authorize
            let line = lines.next_line().await.unwrap().unwrap();
            requests.push(line.clone());
            let rpc: Value = serde_json::from_str(&line).unwrap();
            let id = rpc["id"].as_u64().unwrap();
            let reply = format!("{}\n", json!({ "id": id, "result": true, "error": null }));
            write_half.write_all(reply.as_bytes()).await.unwrap();

            // suggest_difficulty goes unanswered
            let line = lines.next_line().await.unwrap().unwrap();
            requests.push(line.clone());

            // submit verdict
            let line = lines.next_line().await.unwrap().unwrap();
            requests.push(line.clone());
            let rpc: Value = serde_json::from_str(&line).unwrap();
            let id = rpc["id"].as_u64().unwrap();
            let reply = format!("{}\n", json!({ "id": id, "result": true, "error": null }));
            write_half.write_all(reply.as_bytes()).await.unwrap();

            requests
        });

        let mut client = Client::connect(&addr.to_string(), "worker.one")
            .await
            .unwrap();
        client.handshake("x", 1000).await.unwrap();
        assert_eq!(client.extranonce1, "e9695791");
        assert_eq!(client.extranonce2_size, 4);
        assert_eq!(client.version_mask, 0x1fffe000);

        let (mut receiver, mut submitter) = client.split();

        // the notify that raced the configure response comes out first
        let message = receiver.next_message().await.unwrap();
        assert!(matches!(message, PoolMessage::Notify(_)));

        let job = crate::job::test_utils::sample_job("1d2e0c4d3d");
        let id = submitter.submit(&job, 0x276e8947, 0x0a966000).await.unwrap();
        let verdict = receiver.next_message().await.unwrap();
        assert_eq!(verdict, PoolMessage::SubmitResult { id, accepted: true });
        assert_eq!(receiver.stats().accepted, 1);
        assert_eq!(receiver.stats().rejected, 0);

        let requests = pool.await.unwrap();
        assert!(requests[0].contains("mining.subscribe"));
        assert!(requests[1].contains("version-rolling.mask"));
        assert!(requests[2].contains(r#""worker.one","x""#));
        assert!(requests[3].contains("mining.suggest_difficulty"));
        assert!(requests[4].contains(r#""00000000","66221bdf","276e8947","0a966000""#));
    }
}
