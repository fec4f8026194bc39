use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
    Json,
};
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::error;

/// 列出相机的归档录像
pub async fn list_records(
    State(state): State<SharedState>,
    Path(camera): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let dir = archive_dir(&state, &camera)?;

    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        // 相机还没有启动过
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(serde_json::json!({ "camera": camera, "records": [] })));
        }
        Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    {
        let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
        records.push((entry.file_name().to_string_lossy().to_string(), size));
    }
    records.sort();

    let records: Vec<_> = records
        .into_iter()
        .map(|(name, size)| serde_json::json!({ "name": name, "size": size }))
        .collect();

    Ok(Json(serde_json::json!({ "camera": camera, "records": records })))
}

/// 下载单个归档录像
pub async fn serve_record(
    State(state): State<SharedState>,
    Path((camera, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. 只允许访问归档目录下的单个文件
    if !is_plain_file_name(&file_name) {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_string()));
    }
    let file_path = archive_dir(&state, &camera)?.join(&file_name);

    // 2. 打开文件
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 3. 根据扩展名推断 Content-Type
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        )
        .body(body)
        .map_err(|e| {
            error!("Failed to build response for {:?}: {}", file_path, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}

fn archive_dir(state: &SharedState, camera: &str) -> Result<PathBuf, (StatusCode, String)> {
    // 只接受配置中的相机名，配置校验已保证其可作为目录名
    state
        .config
        .camera(camera)
        .map(|cfg| state.config.server.records_root().join(&cfg.name))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Camera [{}] not found", camera)))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == '/' || c == '\\' || c == '\0')
}
