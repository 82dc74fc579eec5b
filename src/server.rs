use crate::import::ImportPipeline;
use crate::notifications::NotificationHub;
use crate::queue::TaskQueue;
use crate::store::TestDataStore;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

/// Shared service handles, built once in the composition root and cloned
/// into each request handler.
#[derive(Clone)]
pub struct AppContext {
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<NotificationHub>,
    pub store: Arc<dyn TestDataStore>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: String,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    client_id: String,
    #[serde(default)]
    unread_only: bool,
}

#[derive(Debug, Deserialize)]
struct ClientQuery {
    client_id: String,
}

/// Full route tree for the HTTP and WebSocket API.
pub fn routes(
    ctx: AppContext,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_ctx = warp::any().map(move || ctx.clone());

    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&json!({
            "status": "healthy",
            "timestamp": Utc::now(),
        }))
    });

    let upload = warp::path!("api" / "runs" / "upload")
        .and(warp::post())
        .and(warp::query::<UploadQuery>())
        .and(warp::body::bytes())
        .and(with_ctx.clone())
        .and_then(upload_handler);

    let get_run = warp::path!("api" / "runs" / i64)
        .and(warp::get())
        .and(with_ctx.clone())
        .and_then(get_run_handler);

    let list_tasks = warp::path!("api" / "tasks")
        .and(warp::get())
        .and(with_ctx.clone())
        .and_then(list_tasks_handler);

    let get_task = warp::path!("api" / "tasks" / String)
        .and(warp::get())
        .and(with_ctx.clone())
        .and_then(get_task_handler);

    let list_notifications = warp::path!("api" / "notifications")
        .and(warp::get())
        .and(warp::query::<NotificationsQuery>())
        .and(with_ctx.clone())
        .and_then(list_notifications_handler);

    let mark_read = warp::path!("api" / "notifications" / String / "read")
        .and(warp::post())
        .and(warp::query::<ClientQuery>())
        .and(with_ctx.clone())
        .and_then(mark_read_handler);

    let ws = warp::path!("api" / "ws" / String)
        .and(warp::ws())
        .and(with_ctx)
        .map(|client_id: String, ws: warp::ws::Ws, ctx: AppContext| {
            ws.on_upgrade(move |socket| client_session(socket, client_id, ctx.hub))
        });

    health
        .or(upload)
        .or(get_run)
        .or(list_tasks)
        .or(get_task)
        .or(list_notifications)
        .or(mark_read)
        .or(ws)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("server"))
}

/// Accept an uploaded result file and queue it for background import.
///
/// Unsupported extensions are rejected here, before a task is created; the
/// caller gets the task id back immediately and polls or listens for the
/// outcome.
async fn upload_handler(
    query: UploadQuery,
    body: warp::hyper::body::Bytes,
    ctx: AppContext,
) -> Result<impl Reply, Rejection> {
    if !ImportPipeline::supported_file(&query.filename) {
        warn!("Rejected upload {}: unsupported extension", query.filename);
        return Ok(warp::reply::with_status(
            warp::reply::json(&json!({
                "error": "Only JSON files are currently supported",
            })),
            StatusCode::BAD_REQUEST,
        ));
    }

    let pipeline = ImportPipeline::new(Arc::clone(&ctx.store), Arc::clone(&ctx.hub));
    let content = body.to_vec();
    let filename = query.filename.clone();
    let client_id = query.client_id.clone();

    let task_id = ctx
        .queue
        .enqueue("process_test_results", async move {
            let summary = pipeline
                .run(&content, &filename, client_id.as_deref())
                .await?;
            Ok(serde_json::to_value(summary)?)
        })
        .await;

    info!("Upload {} queued as task {}", query.filename, task_id);
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({
            "task_id": task_id,
            "status": "pending",
            "message": "Upload accepted for processing",
        })),
        StatusCode::ACCEPTED,
    ))
}

async fn get_run_handler(run_id: i64, ctx: AppContext) -> Result<impl Reply, Rejection> {
    match ctx.store.get_run(run_id).await {
        Ok(Some(run)) => Ok(warp::reply::json(&run)),
        Ok(None) => Err(warp::reject::not_found()),
        Err(e) => {
            warn!("Run {} lookup failed: {}", run_id, e);
            Err(warp::reject::not_found())
        }
    }
}

async fn list_tasks_handler(ctx: AppContext) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&ctx.queue.list_all()))
}

async fn get_task_handler(task_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
    match ctx.queue.status(&task_id) {
        Some(task) => Ok(warp::reply::json(&task)),
        None => Err(warp::reject::not_found()),
    }
}

async fn list_notifications_handler(
    query: NotificationsQuery,
    ctx: AppContext,
) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(
        &ctx.hub.list(&query.client_id, query.unread_only),
    ))
}

async fn mark_read_handler(
    notification_id: String,
    query: ClientQuery,
    ctx: AppContext,
) -> Result<impl Reply, Rejection> {
    ctx.hub.mark_read(&query.client_id, &notification_id);
    Ok(warp::reply::json(&json!({ "status": "success" })))
}

/// One WebSocket session: register with the hub, forward notifications as
/// JSON text frames, answer "ping" with "pong", and deregister on close.
async fn client_session(socket: WebSocket, client_id: String, hub: Arc<NotificationHub>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.connect(&client_id, tx);
    info!("WebSocket client {} connected", client_id);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(notification) => {
                        let payload = match serde_json::to_string(&notification) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!("Could not serialize notification {}: {}", notification.id, e);
                                continue;
                            }
                        };
                        if ws_tx.send(Message::text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(message)) => {
                        if message.is_close() {
                            break;
                        }
                        if message.to_str() == Ok("ping")
                            && ws_tx.send(Message::text("pong")).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error for client {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    hub.disconnect(&client_id);
    info!("WebSocket client {} disconnected", client_id);
}
