//! Local IPC surface (spec §6, optional): the CLI ↔ daemon channel.
//!
//! A stream-oriented unix-domain endpoint; each connection carries
//! exactly one JSON request then one JSON response, then closes. The
//! accept-loop-spawns-a-task-per-connection shape mirrors the teacher's
//! `server.rs::run`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::error::GroupName;
use crate::manager::SyncManager;

#[derive(Debug, Deserialize)]
struct Request {
    action: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    options: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Response {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Response { success: true, message: message.into(), data: None, groups: None, errors: None }
    }

    fn err(message: impl Into<String>) -> Self {
        Response { success: false, message: message.into(), data: None, groups: None, errors: None }
    }
}

pub struct IpcServer {
    socket_path: PathBuf,
    listen_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf) -> Self {
        IpcServer { socket_path, listen_task: tokio::sync::Mutex::new(None) }
    }

    pub async fn start(&self, manager: Arc<SyncManager>) -> crate::error::SyncResult<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::SyncError::Persistence(format!("creating {}: {e}", parent.display())))?;
        }
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| crate::error::SyncError::Bind(format!("{}: {e}", self.socket_path.display())))?;

        let path_for_task = self.socket_path.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager).await {
                                tracing::warn!(error = %e, "ipc connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(path = %path_for_task.display(), error = %e, "ipc accept failed");
                    }
                }
            }
        });
        *self.listen_task.lock().await = Some(task);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn handle_connection(mut stream: UnixStream, manager: Arc<SyncManager>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    let response = match serde_json::from_slice::<Request>(&buf) {
        Ok(request) => dispatch(request, &manager).await,
        Err(e) => Response::err(format!("malformed request: {e}")),
    };

    let bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
    stream.write_all(&bytes).await?;
    stream.shutdown().await
}

async fn dispatch(request: Request, manager: &SyncManager) -> Response {
    match request.action.as_str() {
        "join" => {
            for group in &request.groups {
                if let Err(e) = manager.join_group(&GroupName::from(group.clone())).await {
                    return Response::err(format!("join failed: {e}"));
                }
            }
            Response::ok("joined")
        }
        "leave" => {
            for group in &request.groups {
                if let Err(e) = manager.leave_group(&GroupName::from(group.clone())).await {
                    return Response::err(format!("leave failed: {e}"));
                }
            }
            Response::ok("left")
        }
        "list" => match manager.list_groups().await {
            Ok(groups) => Response {
                success: true,
                message: "ok".to_string(),
                data: None,
                groups: Some(groups.into_iter().map(|g| g.0).collect()),
                errors: None,
            },
            Err(e) => Response::err(format!("list failed: {e}")),
        },
        "status" => {
            let connected = manager.is_connected().await;
            Response {
                success: true,
                message: "ok".to_string(),
                data: Some(serde_json::json!({ "connected": connected })),
                groups: None,
                errors: None,
            }
        }
        "resync" => Response::ok("resync is handled by the clipboard history layer"),
        other => Response::err(format!("Unknown action: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_reports_message() {
        let response = Response::err("Unknown action: bogus".to_string());
        assert!(!response.success);
        assert_eq!(response.message, "Unknown action: bogus");
    }
}
