//! # RPC Dispatch & Server Loop
//!
//! Exposes the [`Front`] facade over the framed transport. The payload of
//! every frame is one strict JSON-RPC 2.0 object; notifications are rejected
//! (every request must carry an `id`), and params are passed by name.
//!
//! One thread per connection, one in-flight request per connection. That
//! serialization is what keeps streamed binary tails from interleaving with
//! response frames. A connection holds its own [`Front`], so a snapshot
//! under construction dies with its connection — the writer's drop releases
//! the session mutex.
//!
//! Byte streams flow only server → client: a `get_blob` response carries a
//! null JSON-RPC result plus a declared binary tail. Requests that declare a
//! binary tail of their own are rejected; uploads travel base64-encoded in
//! `add_blob_data` params.

use crate::error::{ProtocolError, Result, VaultError};
use crate::front::Front;
use crate::repo::Repository;
use crate::transport;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

// JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const PROCEDURE_EXCEPTION: i32 = -32000;
pub const AUTH_ERROR: i32 = -32001;
pub const PERMISSION_DENIED: i32 = -32002;
pub const INVALID_PARAM_VALUES: i32 = -32003;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// What a handler produces: a JSON result, or a byte stream sent as the
/// frame's binary tail alongside a null result.
enum Outcome {
    Value(Value),
    Stream {
        size: u64,
        source: crate::repo::BlobReader,
    },
}

/// A failed call, already mapped to its JSON-RPC error code.
struct RpcFailure {
    code: i32,
    message: String,
}

impl From<VaultError> for RpcFailure {
    fn from(e: VaultError) -> Self {
        let code = match e {
            VaultError::User(_) => INVALID_PARAM_VALUES,
            _ => PROCEDURE_EXCEPTION,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

type HandlerResult = std::result::Result<Outcome, RpcFailure>;
type Handler = fn(&mut Front, Value) -> HandlerResult;

fn parse_params<P: DeserializeOwned>(params: Value) -> std::result::Result<P, RpcFailure> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| RpcFailure {
        code: INVALID_PARAMS,
        message: format!("invalid params: {e}"),
    })
}

fn ok(value: impl serde::Serialize) -> HandlerResult {
    serde_json::to_value(value)
        .map(Outcome::Value)
        .map_err(|e| RpcFailure {
            code: INTERNAL_ERROR,
            message: format!("result serialization failed: {e}"),
        })
}

// ─── Method handlers ────────────────────────────────────────────────────────

fn rpc_get_repo_path(front: &mut Front, _params: Value) -> HandlerResult {
    ok(front.repo_path().to_string_lossy())
}

fn rpc_get_session_ids(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize, Default)]
    struct P {
        session_name: Option<String>,
    }
    let p: P = parse_params(params)?;
    ok(front.get_session_ids(p.session_name.as_deref())?)
}

fn rpc_get_session_info(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        id: u32,
    }
    let p: P = parse_params(params)?;
    ok(front.get_session_info(p.id)?)
}

fn rpc_get_session_fingerprint(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        id: u32,
    }
    let p: P = parse_params(params)?;
    ok(front.get_session_fingerprint(p.id)?)
}

fn rpc_get_session_bloblist(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        id: u32,
    }
    let p: P = parse_params(params)?;
    ok(front.get_session_bloblist(p.id)?)
}

fn rpc_has_snapshot(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
        id: u32,
    }
    let p: P = parse_params(params)?;
    ok(front.has_snapshot(&p.session_name, p.id)?)
}

fn rpc_find_last_revision(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
    }
    let p: P = parse_params(params)?;
    ok(front.find_last_revision(&p.session_name)?)
}

fn rpc_create_session(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
        #[serde(default)]
        base_session: Option<u32>,
    }
    let p: P = parse_params(params)?;
    front.create_session(&p.session_name, p.base_session)?;
    ok(Value::Null)
}

fn rpc_mksession(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
    }
    let p: P = parse_params(params)?;
    ok(front.mksession(&p.session_name)?)
}

fn rpc_add_blob_data(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        blob_md5: String,
        b64data: String,
    }
    let p: P = parse_params(params)?;
    front.add_blob_data_b64(&p.blob_md5, &p.b64data)?;
    ok(Value::Null)
}

fn rpc_add(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        metadata: crate::bloblist::FileEntry,
    }
    let p: P = parse_params(params)?;
    front.add(p.metadata)?;
    ok(Value::Null)
}

fn rpc_remove(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        filename: String,
    }
    let p: P = parse_params(params)?;
    front.remove(&p.filename)?;
    ok(Value::Null)
}

fn rpc_commit(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize, Default)]
    struct P {
        sessioninfo: Option<crate::reader::ClientData>,
    }
    let p: P = parse_params(params)?;
    ok(front.commit(p.sessioninfo)?)
}

fn rpc_has_blob(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        md5sum: String,
    }
    let p: P = parse_params(params)?;
    ok(front.has_blob(&p.md5sum))
}

fn rpc_get_blob_size(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        md5sum: String,
    }
    let p: P = parse_params(params)?;
    ok(front.get_blob_size(&p.md5sum)?)
}

fn rpc_get_blob(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        md5sum: String,
        #[serde(default)]
        offset: u64,
        #[serde(default = "default_blob_len")]
        size: i64,
    }
    fn default_blob_len() -> i64 {
        -1
    }
    let p: P = parse_params(params)?;
    let size = match p.size {
        -1 => None,
        n if n < 0 => {
            return Err(RpcFailure {
                code: INVALID_PARAM_VALUES,
                message: format!("size must be -1 or non-negative, got {n}"),
            })
        }
        n => Some(n as u64),
    };
    let length = match size {
        Some(len) => len,
        None => front.get_blob_size(&p.md5sum)?.saturating_sub(p.offset),
    };
    let source = front.get_blob(&p.md5sum, p.offset, size)?;
    Ok(Outcome::Stream {
        size: length,
        source,
    })
}

fn rpc_init_verify_blobs(front: &mut Front, _params: Value) -> HandlerResult {
    ok(front.init_verify_blobs()?)
}

fn rpc_verify_some_blobs(front: &mut Front, _params: Value) -> HandlerResult {
    ok(front.verify_some_blobs()?)
}

fn rpc_set_session_ignore_list(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
        list: Vec<String>,
    }
    let p: P = parse_params(params)?;
    front.set_session_ignore_list(&p.session_name, &p.list)?;
    ok(Value::Null)
}

fn rpc_get_session_ignore_list(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
    }
    let p: P = parse_params(params)?;
    ok(front.get_session_ignore_list(&p.session_name)?)
}

fn rpc_set_session_include_list(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
        list: Vec<String>,
    }
    let p: P = parse_params(params)?;
    front.set_session_include_list(&p.session_name, &p.list)?;
    ok(Value::Null)
}

fn rpc_get_session_include_list(front: &mut Front, params: Value) -> HandlerResult {
    #[derive(Deserialize)]
    struct P {
        session_name: String,
    }
    let p: P = parse_params(params)?;
    ok(front.get_session_include_list(&p.session_name)?)
}

fn method_table() -> HashMap<&'static str, Handler> {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert("get_repo_path", rpc_get_repo_path);
    table.insert("get_session_ids", rpc_get_session_ids);
    table.insert("get_session_info", rpc_get_session_info);
    table.insert("get_session_fingerprint", rpc_get_session_fingerprint);
    table.insert("get_session_bloblist", rpc_get_session_bloblist);
    table.insert("has_snapshot", rpc_has_snapshot);
    table.insert("find_last_revision", rpc_find_last_revision);
    table.insert("create_session", rpc_create_session);
    table.insert("mksession", rpc_mksession);
    table.insert("add_blob_data", rpc_add_blob_data);
    table.insert("add", rpc_add);
    table.insert("remove", rpc_remove);
    table.insert("commit", rpc_commit);
    table.insert("has_blob", rpc_has_blob);
    table.insert("get_blob_size", rpc_get_blob_size);
    table.insert("get_blob", rpc_get_blob);
    table.insert("init_verify_blobs", rpc_init_verify_blobs);
    table.insert("verify_some_blobs", rpc_verify_some_blobs);
    table.insert("set_session_ignore_list", rpc_set_session_ignore_list);
    table.insert("get_session_ignore_list", rpc_get_session_ignore_list);
    table.insert("set_session_include_list", rpc_set_session_include_list);
    table.insert("get_session_include_list", rpc_get_session_include_list);
    table
}

// ─── Server loop ────────────────────────────────────────────────────────────

/// Blocking RPC server exposing one repository.
pub struct RpcServer {
    repo: Repository,
    read_timeout: Duration,
}

impl RpcServer {
    pub fn new(repo: Repository, read_timeout: Duration) -> Self {
        Self { repo, read_timeout }
    }

    /// Binds to `addr` and serves until the process dies.
    pub fn bind_and_serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener)
    }

    /// Accept loop over an existing listener, one thread per connection.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "repository rpc server listening");
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let repo = self.repo.clone();
                    let timeout = self.read_timeout;
                    std::thread::spawn(move || {
                        let peer = stream
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|_| "unknown".to_string());
                        tracing::debug!(peer, "connection accepted");
                        if let Err(e) = handle_connection(stream, repo, timeout) {
                            tracing::warn!(peer, "connection closed: {e}");
                        }
                    });
                }
                Err(e) => tracing::warn!("accept failed: {e}"),
            }
        }
        Ok(())
    }
}

/// Serves one connection until clean close or protocol violation.
fn handle_connection(stream: TcpStream, repo: Repository, read_timeout: Duration) -> Result<()> {
    stream.set_read_timeout(Some(read_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut front = Front::new(repo);
    let methods = method_table();

    loop {
        let (payload_size, binary) = match transport::read_header(&mut reader)? {
            None => return Ok(()),
            Some(header) => header,
        };
        if binary.is_some() {
            send_error(&mut writer, Value::Null, INVALID_REQUEST, "uploads are not accepted")?;
            return Err(ProtocolError::UnexpectedUpload.into());
        }

        let payload = transport::read_payload(&mut reader, payload_size)?;
        let request: RpcRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                send_error(&mut writer, Value::Null, PARSE_ERROR, &format!("parse error: {e}"))?;
                return Err(ProtocolError::MalformedPayload(e.to_string()).into());
            }
        };
        if request.jsonrpc != "2.0" {
            send_error(&mut writer, Value::Null, INVALID_REQUEST, "jsonrpc must be \"2.0\"")?;
            return Err(ProtocolError::MalformedPayload(format!(
                "unsupported jsonrpc version {:?}",
                request.jsonrpc
            ))
            .into());
        }
        let id = match request.id {
            Some(id) if !id.is_null() => id,
            _ => {
                send_error(
                    &mut writer,
                    Value::Null,
                    INVALID_REQUEST,
                    "notifications are not accepted",
                )?;
                return Err(ProtocolError::NotificationRejected.into());
            }
        };

        match methods.get(request.method.as_str()) {
            None => send_error(
                &mut writer,
                id,
                METHOD_NOT_FOUND,
                &format!("no such method: {}", request.method),
            )?,
            Some(handler) => match handler(&mut front, request.params) {
                Ok(Outcome::Value(result)) => {
                    send_payload(
                        &mut writer,
                        &json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        None,
                    )?;
                }
                Ok(Outcome::Stream { size, mut source }) => match u32::try_from(size) {
                    Err(_) => send_error(
                        &mut writer,
                        id,
                        PROCEDURE_EXCEPTION,
                        "blob range too large for a single frame",
                    )?,
                    Ok(declared) => {
                        send_payload(
                            &mut writer,
                            &json!({"jsonrpc": "2.0", "id": id, "result": Value::Null}),
                            Some(declared),
                        )?;
                        transport::write_binary_stream(&mut writer, &mut source, size)?;
                        writer.flush()?;
                    }
                },
                Err(failure) => send_error(&mut writer, id, failure.code, &failure.message)?,
            },
        }
    }
}

fn send_payload(writer: &mut impl Write, value: &Value, binary_size: Option<u32>) -> Result<()> {
    let payload =
        serde_json::to_vec(value).map_err(|e| anyhow::anyhow!("response serialization: {e}"))?;
    transport::write_frame(writer, &payload, binary_size)?;
    if binary_size.is_none() {
        writer.flush()?;
    }
    Ok(())
}

fn send_error(writer: &mut impl Write, id: Value, code: i32, message: &str) -> Result<()> {
    send_payload(
        writer,
        &json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        }),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::md5_hex;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::io::Read;
    use std::net::SocketAddr;

    fn start_server(repo: Repository) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let repo = repo.clone();
                std::thread::spawn(move || {
                    let _ = handle_connection(stream, repo, Duration::from_secs(10));
                });
            }
        });
        addr
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).unwrap()
    }

    fn send_request(stream: &mut TcpStream, request: &Value) {
        let payload = serde_json::to_vec(request).unwrap();
        transport::write_frame(stream, &payload, None).unwrap();
    }

    fn read_response(stream: &mut TcpStream) -> (Value, Option<Vec<u8>>) {
        let (payload_size, binary) = transport::read_header(stream).unwrap().unwrap();
        let payload = transport::read_payload(stream, payload_size).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        let tail = binary.map(|size| {
            let mut tail = vec![0u8; size as usize];
            stream.read_exact(&mut tail).unwrap();
            tail
        });
        (value, tail)
    }

    fn call(stream: &mut TcpStream, id: u64, method: &str, params: Value) -> Value {
        send_request(
            stream,
            &json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
        );
        let (response, tail) = read_response(stream);
        assert!(tail.is_none());
        assert_eq!(response["id"], id);
        response
    }

    fn new_repo(dir: &std::path::Path) -> Repository {
        Repository::create(&dir.join("repo")).unwrap()
    }

    #[test]
    fn full_snapshot_lifecycle_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(new_repo(dir.path()));
        let mut stream = connect(addr);

        let response = call(&mut stream, 1, "mksession", json!({"session_name": "docs"}));
        assert_eq!(response["result"], 1);

        let data = b"The quick brown fox jumps over the lazy dog";
        let hash = md5_hex(data);
        call(
            &mut stream,
            2,
            "create_session",
            json!({"session_name": "docs", "base_session": 1}),
        );
        let response = call(
            &mut stream,
            3,
            "add_blob_data",
            json!({"blob_md5": hash, "b64data": BASE64.encode(data)}),
        );
        assert!(response["error"].is_null());
        call(
            &mut stream,
            4,
            "add",
            json!({"metadata": {"filename": "note.txt", "md5sum": hash, "size": data.len()}}),
        );
        let response = call(
            &mut stream,
            5,
            "commit",
            json!({"sessioninfo": {"name": "docs"}}),
        );
        assert_eq!(response["result"], 2);

        let response = call(
            &mut stream,
            6,
            "find_last_revision",
            json!({"session_name": "docs"}),
        );
        assert_eq!(response["result"], 2);

        let response = call(&mut stream, 7, "get_session_bloblist", json!({"id": 2}));
        let list = response["result"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["filename"], "note.txt");
        assert_eq!(list[0]["size"], data.len());

        let response = call(&mut stream, 8, "has_blob", json!({"md5sum": hash}));
        assert_eq!(response["result"], true);
    }

    #[test]
    fn get_blob_streams_a_binary_tail() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        let data = b"streamed blob content, long enough to matter";
        let hash = md5_hex(data);
        {
            let mut writer = repo.create_session("s", None, None).unwrap();
            writer.add_blob_data(&hash, data).unwrap();
            writer
                .add(crate::bloblist::FileEntry::new("f.bin", hash.clone()))
                .unwrap();
            writer.commit(None).unwrap();
        }
        let addr = start_server(repo);
        let mut stream = connect(addr);

        send_request(
            &mut stream,
            &json!({"jsonrpc": "2.0", "id": 1, "method": "get_blob",
                    "params": {"md5sum": hash}}),
        );
        let (response, tail) = read_response(&mut stream);
        assert!(response["result"].is_null());
        assert!(response.get("error").is_none());
        assert_eq!(tail.unwrap(), data);

        // Ranged read with the -1 "to end" sentinel.
        send_request(
            &mut stream,
            &json!({"jsonrpc": "2.0", "id": 2, "method": "get_blob",
                    "params": {"md5sum": hash, "offset": 9, "size": -1}}),
        );
        let (_, tail) = read_response(&mut stream);
        assert_eq!(tail.unwrap(), &data[9..]);

        send_request(
            &mut stream,
            &json!({"jsonrpc": "2.0", "id": 3, "method": "get_blob",
                    "params": {"md5sum": hash, "offset": 0, "size": 8}}),
        );
        let (_, tail) = read_response(&mut stream);
        assert_eq!(tail.unwrap(), &data[..8]);
    }

    #[test]
    fn unknown_method_and_bad_params() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(new_repo(dir.path()));
        let mut stream = connect(addr);

        let response = call(&mut stream, 1, "no_such_method", json!({}));
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

        let response = call(&mut stream, 2, "get_session_info", json!({"wrong": true}));
        assert_eq!(response["error"]["code"], INVALID_PARAMS);

        // Domain validation failures map to invalid param values.
        let response = call(&mut stream, 3, "mksession", json!({"session_name": "__meta"}));
        assert_eq!(response["error"]["code"], INVALID_PARAM_VALUES);

        // The connection survives plain error responses.
        let response = call(&mut stream, 4, "get_session_ids", json!({}));
        assert_eq!(response["result"], json!([]));
    }

    #[test]
    fn notifications_terminate_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(new_repo(dir.path()));
        let mut stream = connect(addr);

        send_request(
            &mut stream,
            &json!({"jsonrpc": "2.0", "method": "get_session_ids", "params": {}}),
        );
        let (response, _) = read_response(&mut stream);
        assert_eq!(response["error"]["code"], INVALID_REQUEST);

        // Server closed the connection afterwards.
        assert!(transport::read_header(&mut stream).unwrap().is_none());
    }

    #[test]
    fn upload_frames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(new_repo(dir.path()));
        let mut stream = connect(addr);

        let payload =
            serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": 1, "method": "get_session_ids"}))
                .unwrap();
        // Header declares a tail; the server must refuse before consuming it.
        transport::write_frame(&mut stream, &payload, Some(4)).unwrap();

        let (response, _) = read_response(&mut stream);
        assert_eq!(response["error"]["code"], INVALID_REQUEST);
        assert!(transport::read_header(&mut stream).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(new_repo(dir.path()));
        let mut stream = connect(addr);

        transport::write_frame(&mut stream, b"{not json", None).unwrap();
        let (response, _) = read_response(&mut stream);
        assert_eq!(response["error"]["code"], PARSE_ERROR);
        assert!(transport::read_header(&mut stream).unwrap().is_none());
    }

    #[test]
    fn writer_errors_surface_as_procedure_exceptions() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(new_repo(dir.path()));
        let mut stream = connect(addr);

        call(&mut stream, 1, "create_session", json!({"session_name": "w"}));
        // Unknown blob reference fails inside the writer.
        let response = call(
            &mut stream,
            2,
            "add",
            json!({"metadata": {"filename": "f.txt", "md5sum": "d41d8cd98f00b204e9800998ecf8427e"}}),
        );
        assert_eq!(response["error"]["code"], PROCEDURE_EXCEPTION);
    }
}
