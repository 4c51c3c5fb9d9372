use super::*;
use axum::{
    extract::{Multipart, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::protocol::{CalculateResponse, SOCKET_IO_PATH};
use tokio::net::TcpListener;

use crate::types::SelectedFile;

fn endpoints(base: &str) -> Endpoints {
    Endpoints::new(Url::parse(base).expect("base url"), SOCKET_IO_PATH)
}

/// Talks to the loopback test server directly, whatever proxy the host has configured.
fn local_service(base: &str) -> HttpComputeService {
    let http = Client::builder().no_proxy().build().expect("http client");
    HttpComputeService::with_client(http, endpoints(base))
}

#[test]
fn endpoint_layout_follows_server_routes() {
    let ep = endpoints("http://127.0.0.1:5000");
    assert_eq!(ep.calculate().as_str(), "http://127.0.0.1:5000/api/calculate");
    assert_eq!(ep.sample().as_str(), "http://127.0.0.1:5000/sample");
    assert_eq!(ep.health().as_str(), "http://127.0.0.1:5000/health");
    assert_eq!(
        ep.download("result.xlsx").as_str(),
        "http://127.0.0.1:5000/api/download/result.xlsx"
    );
    assert_eq!(
        ep.websocket().expect("ws"),
        "ws://127.0.0.1:5000/socket.io/?EIO=4&transport=websocket"
    );
}

#[test]
fn endpoints_keep_a_mount_prefix_and_encode_filenames() {
    let ep = endpoints("https://host.example/commute");
    assert_eq!(
        ep.calculate().as_str(),
        "https://host.example/commute/api/calculate"
    );
    assert_eq!(
        ep.download("a b/c.xlsx").as_str(),
        "https://host.example/commute/api/download/a%20b%2Fc.xlsx"
    );
    assert_eq!(
        ep.websocket().expect("ws"),
        "wss://host.example/commute/socket.io/?EIO=4&transport=websocket"
    );
}

#[test]
fn content_disposition_filename_variants() {
    assert_eq!(
        filename_from_content_disposition("attachment; filename=commute_result.xlsx").as_deref(),
        Some("commute_result.xlsx")
    );
    assert_eq!(
        filename_from_content_disposition("attachment; filename=\"quoted name.xlsx\"").as_deref(),
        Some("quoted name.xlsx")
    );
    assert_eq!(
        filename_from_content_disposition(
            "attachment; filename=fallback.xlsx; filename*=UTF-8''%E7%BB%93%E6%9E%9C.xlsx"
        )
        .as_deref(),
        Some("结果.xlsx")
    );
    assert_eq!(filename_from_content_disposition("inline"), None);
}

async fn handle_calculate(mut multipart: Multipart) -> impl IntoResponse {
    let mut address = None;
    let mut file = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let data = field.bytes().await.unwrap_or_default();
        match name.as_str() {
            "target_address" => address = Some(String::from_utf8_lossy(&data).to_string()),
            "file" => file = Some((filename.unwrap_or_default(), data)),
            _ => {}
        }
    }
    match (address, file) {
        (Some(address), Some((filename, data))) if !data.is_empty() => Json(CalculateResponse {
            filename: format!("{address}-{filename}-{}", data.len()),
            status: Some("success".into()),
            total_processed: Some(1),
        })
        .into_response(),
        _ => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("missing multipart fields")),
        )
            .into_response(),
    }
}

async fn handle_download(Path(filename): Path<String>) -> impl IntoResponse {
    if filename == "result.xlsx" {
        (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            b"artifact".to_vec(),
        )
            .into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(ErrorBody::new("file missing"))).into_response()
    }
}

async fn handle_health() -> impl IntoResponse {
    // isoformat() of a naive local datetime, as the server emits it
    (
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"healthy","api_keys_available":2,"timestamp":"2024-05-01T12:30:45.123456"}"#,
    )
}

async fn spawn_compute_server() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/api/calculate", post(handle_calculate))
        .route("/api/download/:filename", get(handle_download))
        .route("/health", get(handle_health));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test]
async fn calculate_posts_file_and_address_as_multipart() {
    let server_url = spawn_compute_server().await.expect("spawn server");
    let service = local_service(&server_url);

    let reply = service
        .calculate(CalculationUpload {
            target_address: "Main St 1".into(),
            file: SelectedFile::new("homes.xlsx", b"xlsx-bytes".to_vec()),
        })
        .await
        .expect("calculate");

    assert!(reply.is_success());
    let body: CalculateResponse = serde_json::from_slice(&reply.body).expect("json body");
    assert_eq!(body.filename, "Main St 1-homes.xlsx-10");
}

#[tokio::test]
async fn download_returns_bytes_or_server_error_message() {
    let server_url = spawn_compute_server().await.expect("spawn server");
    let service = local_service(&server_url);

    let bytes = service.download("result.xlsx").await.expect("download");
    assert_eq!(&bytes[..], b"artifact");

    let err = service
        .download("other.xlsx")
        .await
        .expect_err("missing file");
    let api = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(api.status, 404);
    assert_eq!(api.message, "file missing");
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let service = local_service(&format!("http://{addr}"));
    let err = service
        .calculate(CalculationUpload {
            target_address: "x".into(),
            file: SelectedFile::new("f.xlsx", b"1".to_vec()),
        })
        .await
        .expect_err("connection refused");
    assert!(err.to_string().contains("failed to reach"));
}

#[tokio::test]
async fn health_accepts_timestamp_without_offset() {
    let server_url = spawn_compute_server().await.expect("spawn server");
    let service = local_service(&server_url);

    let health = service.health().await.expect("health");
    assert!(health.is_healthy());
    assert_eq!(health.api_keys_available, 2);
    assert_eq!(health.timestamp.to_string(), "2024-05-01 12:30:45.123456");
}
