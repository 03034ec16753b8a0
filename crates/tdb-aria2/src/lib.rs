//! aria2 adapter (download manager).
//!
//! Implements the `tdb-core` DownloadPort over aria2's JSON-RPC interface
//! (`POST <host>:<port>/jsonrpc`).

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use tdb_core::{
    domain::JobHandle,
    download::{DownloadPort, JobState, JobStatus},
    errors::Error,
    Result,
};

/// Options applied once at startup; aria2 owns retries and segmented fetching.
pub const GLOBAL_OPTIONS: &[(&str, &str)] = &[
    ("max-tries", "50"),
    ("retry-wait", "3"),
    ("continue", "true"),
    ("allow-overwrite", "true"),
    ("min-split-size", "4M"),
    ("split", "10"),
];

const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
    "files",
];

#[derive(Debug)]
pub struct Aria2Client {
    endpoint: String,
    secret: Option<String>,
    http: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TellStatus {
    gid: String,
    status: String,
    total_length: String,
    completed_length: String,
    download_speed: String,
    error_message: Option<String>,
    files: Vec<FileEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileEntry {
    path: String,
}

impl Aria2Client {
    pub fn new(endpoint: impl Into<String>, secret: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Config(format!("aria2 http client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            secret,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// aria2 version string; used as a startup reachability probe.
    pub async fn version(&self) -> Result<String> {
        let v: Value = self.call("aria2.getVersion", Vec::new()).await?;
        Ok(v.get("version")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn configure_global(&self, options: &[(&str, &str)]) -> Result<()> {
        let opts: serde_json::Map<String, Value> = options
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        let _: String = self
            .call("aria2.changeGlobalOption", vec![Value::Object(opts)])
            .await?;
        Ok(())
    }

    fn build_params(&self, params: Vec<Value>) -> Vec<Value> {
        match &self.secret {
            Some(secret) => {
                let mut out = Vec::with_capacity(params.len() + 1);
                out.push(Value::String(format!("token:{secret}")));
                out.extend(params);
                out
            }
            None => params,
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: format!("tdb-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
            method,
            params: self.build_params(params),
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("aria2 request error: {e}")))?;

        // aria2 reports RPC failures with HTTP 400 and a JSON body; parse either way.
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Rpc(format!("aria2 read error: {e}")))?;
        let parsed: RpcResponse<T> = serde_json::from_str(&body).map_err(|e| {
            Error::Rpc(format!(
                "aria2 {method} returned {status}: {e}: {}",
                body.chars().take(200).collect::<String>()
            ))
        })?;

        decode_response(method, parsed)
    }
}

fn decode_response<T>(method: &str, resp: RpcResponse<T>) -> Result<T> {
    if let Some(err) = resp.error {
        return Err(map_rpc_error(err));
    }
    resp.result
        .ok_or_else(|| Error::Rpc(format!("aria2 {method}: empty result")))
}

fn map_rpc_error(err: RpcError) -> Error {
    if err.message.contains("is not found") {
        if let Some(gid) = err
            .message
            .split_whitespace()
            .nth(1)
            .filter(|_| err.message.starts_with("GID"))
        {
            return Error::JobNotFound(gid.to_string());
        }
        return Error::JobNotFound(err.message);
    }
    Error::Rpc(format!("aria2 error {}: {}", err.code, err.message))
}

fn map_state(status: &str) -> JobState {
    match status {
        "active" => JobState::Active,
        "waiting" | "paused" => JobState::Queued,
        "complete" => JobState::Complete,
        "removed" => JobState::Cancelled,
        _ => JobState::Failed,
    }
}

fn parse_num(s: &str) -> u64 {
    s.trim().parse::<u64>().unwrap_or(0)
}

impl From<TellStatus> for JobStatus {
    fn from(s: TellStatus) -> Self {
        let path = s
            .files
            .into_iter()
            .map(|f| f.path)
            .find(|p| !p.is_empty())
            .map(PathBuf::from);
        let name = path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string());
        let state = map_state(&s.status);

        JobStatus {
            name,
            total_length: parse_num(&s.total_length),
            completed_length: parse_num(&s.completed_length),
            download_speed: parse_num(&s.download_speed),
            state,
            error_message: s.error_message.filter(|_| state == JobState::Failed),
            local_file_path: path,
        }
    }
}

#[async_trait]
impl DownloadPort for Aria2Client {
    async fn submit(&self, uri: &str) -> Result<JobHandle> {
        let gid: String = self
            .call("aria2.addUri", vec![json!([uri]), json!({})])
            .await?;
        Ok(JobHandle(gid))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let raw: TellStatus = self
            .call("aria2.tellStatus", vec![json!(handle.0), json!(STATUS_KEYS)])
            .await?;
        tracing::debug!(gid = %raw.gid, status = %raw.status, "aria2 status");
        Ok(raw.into())
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        // Running jobs need forceRemove; stopped ones only have a result to purge.
        match self
            .call::<String>("aria2.forceRemove", vec![json!(handle.0)])
            .await
        {
            Ok(_) => Ok(()),
            Err(force_err) => {
                tracing::debug!(gid = %handle, "forceRemove failed ({force_err}), purging result");
                let _: String = self
                    .call("aria2.removeDownloadResult", vec![json!(handle.0)])
                    .await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(secret: Option<&str>) -> Aria2Client {
        Aria2Client::new("http://localhost:6800/jsonrpc", secret.map(str::to_string)).unwrap()
    }

    #[test]
    fn secret_is_prepended_as_token() {
        let params = client(Some("s3cr3t")).build_params(vec![json!("gid")]);
        assert_eq!(params, vec![json!("token:s3cr3t"), json!("gid")]);

        let params = client(None).build_params(vec![json!("gid")]);
        assert_eq!(params, vec![json!("gid")]);
    }

    #[test]
    fn tell_status_maps_to_job_status() {
        let body = r#"{"id":"tdb-1","jsonrpc":"2.0","result":{
            "gid":"2089b05ecca3d829","status":"active",
            "totalLength":"500000000","completedLength":"125000000","downloadSpeed":"2500000",
            "files":[{"index":"1","path":"/downloads/movie.mp4","length":"500000000"}]}}"#;
        let resp: RpcResponse<TellStatus> = serde_json::from_str(body).unwrap();
        let status: JobStatus = decode_response("aria2.tellStatus", resp).unwrap().into();

        assert_eq!(status.state, JobState::Active);
        assert_eq!(status.total_length, 500_000_000);
        assert_eq!(status.completed_length, 125_000_000);
        assert_eq!(status.download_speed, 2_500_000);
        assert_eq!(status.name.as_deref(), Some("movie.mp4"));
        assert_eq!(
            status.local_file_path,
            Some(PathBuf::from("/downloads/movie.mp4"))
        );
        assert_eq!(status.error_message, None);
    }

    #[test]
    fn metadata_not_yet_known() {
        let body = r#"{"result":{"gid":"a","status":"waiting","totalLength":"0",
            "completedLength":"0","downloadSpeed":"0","files":[{"path":""}]}}"#;
        let resp: RpcResponse<TellStatus> = serde_json::from_str(body).unwrap();
        let status: JobStatus = decode_response("m", resp).unwrap().into();
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.name, None);
        assert_eq!(status.local_file_path, None);
    }

    #[test]
    fn error_status_keeps_message() {
        let body = r#"{"result":{"gid":"a","status":"error","errorCode":"3",
            "errorMessage":"Resource not found","totalLength":"0","completedLength":"0",
            "downloadSpeed":"0","files":[]}}"#;
        let resp: RpcResponse<TellStatus> = serde_json::from_str(body).unwrap();
        let status: JobStatus = decode_response("m", resp).unwrap().into();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_message.as_deref(), Some("Resource not found"));
    }

    #[test]
    fn state_mapping() {
        assert_eq!(map_state("complete"), JobState::Complete);
        assert_eq!(map_state("removed"), JobState::Cancelled);
        assert_eq!(map_state("paused"), JobState::Queued);
        assert_eq!(map_state("error"), JobState::Failed);
    }

    #[test]
    fn unknown_gid_is_job_not_found() {
        let body = r#"{"id":"1","jsonrpc":"2.0","error":{"code":1,"message":"GID 2089b05ecca3d829 is not found"}}"#;
        let resp: RpcResponse<TellStatus> = serde_json::from_str(body).unwrap();
        match decode_response("aria2.tellStatus", resp) {
            Err(Error::JobNotFound(gid)) => assert_eq!(gid, "2089b05ecca3d829"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn other_rpc_errors_stay_rpc_errors() {
        let body = r#"{"error":{"code":1,"message":"Unauthorized"}}"#;
        let resp: RpcResponse<String> = serde_json::from_str(body).unwrap();
        assert!(matches!(decode_response("m", resp), Err(Error::Rpc(_))));
    }

    #[tokio::test]
    async fn unreachable_daemon_is_an_rpc_error() {
        let c = Aria2Client::new("http://127.0.0.1:1/jsonrpc", None).unwrap();
        assert!(matches!(c.submit("http://x").await, Err(Error::Rpc(_))));
    }

    #[test]
    fn request_serializes_as_json_rpc() {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: "tdb-1".to_string(),
            method: "aria2.addUri",
            params: client(None).build_params(vec![json!(["http://x"]), json!({})]),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"jsonrpc":"2.0","id":"tdb-1","method":"aria2.addUri","params":[["http://x"],{}]})
        );
    }
}
