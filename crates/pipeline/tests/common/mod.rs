//! In-process stub of the parts of the ComfyUI server the pipeline uses.
//!
//! Prompt behaviour is chosen by the positive prompt text (node `6`):
//! - contains `fail`: history reports an execution error
//! - contains `hang`: never finishes, listed as running in `/queue`
//! - contains `stuck`: never finishes, listed as pending in `/queue`
//! - contains `flaky`: the first [`FLAKY_FAILURES`] history reads return
//!   503, then it finishes
//! - contains `pair`: produces two output images
//! - anything else: finishes on the second history poll
//!
//! With `ws_driven`, prompts only finish once the WebSocket handler has
//! announced `execution_success` for them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use comfybatch_comfyui::api::ComfyUIApi;
use comfybatch_comfyui::retry::RetryConfig;
use comfybatch_core::ini::IniDocument;
use comfybatch_core::mapping::{FieldValues, ParameterMapping};
use comfybatch_core::workflow::WorkflowDocument;
use comfybatch_pipeline::context::{BatchContext, RunOptions};
use comfybatch_pipeline::translate::PromptTranslator;

pub const FLAKY_FAILURES: u32 = 3;

pub const MAPPING: &str = "\
[bindings]
positive_prompt = 6.text
negative_prompt = 7.text
image = 10.image
seed = 3.seed
steps = 3.steps
cfg = 3.cfg
denoise = 3.denoise ; not present in this workflow

[defaults]
steps = 30
seed = increment:100
";

pub fn workflow() -> WorkflowDocument {
    WorkflowDocument::from_value(json!({
        "3": {"class_type": "KSampler", "inputs": {
            "seed": 1, "steps": 20, "cfg": 7.5, "sampler_name": "euler",
            "model": ["4", 0], "positive": ["6", 0], "negative": ["7", 0], "latent_image": ["10", 0]
        }},
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.safetensors"}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
        "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
        "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0], "vae": ["4", 2]}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI", "images": ["8", 0]}},
        "10": {"class_type": "LoadImage", "inputs": {"image": "example.png"}}
    }))
    .unwrap()
}

#[derive(Default)]
pub struct Stub {
    pub ws_driven: bool,
    next_id: AtomicU32,
    pub submitted: Mutex<Vec<Value>>,
    prompts: Mutex<HashMap<String, String>>,
    pub polls: Mutex<HashMap<String, u32>>,
    finished: Mutex<HashSet<String>>,
    pub uploads: Mutex<Vec<String>>,
    pub interrupts: AtomicU32,
    pub deletes: AtomicU32,
    announce: Mutex<Option<broadcast::Sender<String>>>,
}

impl Stub {
    fn prompt_text(&self, id: &str) -> Option<String> {
        self.prompts.lock().unwrap().get(id).cloned()
    }

    fn announcer(&self) -> broadcast::Sender<String> {
        self.announce
            .lock()
            .unwrap()
            .get_or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

async fn prompt(State(stub): State<Arc<Stub>>, Json(body): Json<Value>) -> Json<Value> {
    let n = stub.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let id = format!("p-{n}");
    let text = body["prompt"]["6"]["inputs"]["text"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    stub.prompts.lock().unwrap().insert(id.clone(), text);
    stub.submitted.lock().unwrap().push(body);
    let _ = stub.announcer().send(id.clone());
    Json(json!({"prompt_id": id, "number": n, "node_errors": {}}))
}

async fn history(State(stub): State<Arc<Stub>>, UrlPath(id): UrlPath<String>) -> Response {
    let Some(text) = stub.prompt_text(&id) else {
        return Json(json!({})).into_response();
    };
    let polls = {
        let mut polls = stub.polls.lock().unwrap();
        let count = polls.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if text.contains("flaky") && polls <= FLAKY_FAILURES {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let done = if text.contains("hang") || text.contains("stuck") {
        false
    } else if text.contains("flaky") {
        true
    } else if stub.ws_driven {
        stub.finished.lock().unwrap().contains(&id)
    } else {
        polls >= 2
    };
    if !done {
        return Json(json!({})).into_response();
    }

    let entry = if text.contains("fail") {
        json!({
            "outputs": {},
            "status": {"status_str": "error", "completed": false, "messages": [
                ["execution_start", {"prompt_id": id}],
                ["execution_error", {
                    "prompt_id": id, "node_id": "3", "node_type": "KSampler",
                    "exception_message": "boom"
                }]
            ]}
        })
    } else {
        let image = |n: u32| {
            json!({"filename": format!("{id}_{n:05}_.png"), "subfolder": "", "type": "output"})
        };
        let mut images = vec![image(1)];
        if text.contains("pair") {
            images.push(image(2));
        }
        json!({
            "outputs": {"9": {"images": images}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        })
    };
    let mut response = serde_json::Map::new();
    response.insert(id, entry);
    Json(Value::Object(response)).into_response()
}

async fn view(Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    match q.get("filename") {
        Some(name) => (StatusCode::OK, format!("image:{name}").into_bytes()).into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn upload(State(stub): State<Arc<Stub>>, body: Bytes) -> Json<Value> {
    let body = String::from_utf8_lossy(&body);
    let name = body
        .split("filename=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap_or("unknown.png")
        .to_string();
    stub.uploads.lock().unwrap().push(name.clone());
    Json(json!({"name": name, "subfolder": "batch", "type": "input"}))
}

async fn queue(State(stub): State<Arc<Stub>>) -> Json<Value> {
    let prompts = stub.prompts.lock().unwrap();
    let listed = |marker: &str| -> Vec<Value> {
        prompts
            .iter()
            .filter(|(_, text)| text.contains(marker))
            .map(|(id, _)| json!([0, id, {}, {}, ["9"]]))
            .collect()
    };
    Json(json!({"queue_running": listed("hang"), "queue_pending": listed("stuck")}))
}

async fn interrupt(State(stub): State<Arc<Stub>>) -> StatusCode {
    stub.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn delete_from_queue(State(stub): State<Arc<Stub>>) -> StatusCode {
    stub.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn ws(State(stub): State<Arc<Stub>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| announce_completions(socket, stub))
}

/// Finish every submitted prompt shortly after it is queued and tell the
/// client over the socket.
async fn announce_completions(mut socket: WebSocket, stub: Arc<Stub>) {
    let mut rx = stub.announcer().subscribe();
    let mut pending: Vec<String> = stub.prompts.lock().unwrap().keys().cloned().collect();

    loop {
        for id in pending.drain(..) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stub.finished.lock().unwrap().insert(id.clone());
            let frame = json!({"type": "execution_success", "data": {"prompt_id": id}}).to_string();
            if socket.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        tokio::select! {
            id = rx.recv() => match id {
                Ok(id) => pending.push(id),
                Err(_) => return,
            },
            msg = socket.recv() => if msg.is_none() { return },
        }
    }
}

pub async fn spawn_stub(ws_driven: bool) -> (String, Arc<Stub>) {
    let stub = Arc::new(Stub {
        ws_driven,
        ..Default::default()
    });
    let app = Router::new()
        .route("/prompt", post(prompt))
        .route("/history/{id}", get(history))
        .route("/view", get(view))
        .route("/upload/image", post(upload))
        .route("/queue", get(queue).post(delete_from_queue))
        .route("/interrupt", post(interrupt))
        .route("/ws", get(ws))
        .with_state(Arc::clone(&stub));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), stub)
}

pub fn options(output_dir: &Path) -> RunOptions {
    RunOptions {
        output_dir: output_dir.to_path_buf(),
        poll_interval: Duration::from_millis(50),
        timeout: Duration::from_secs(10),
        websocket: false,
        write_report: true,
        overrides: FieldValues::new(),
    }
}

pub fn context(url: &str, options: RunOptions) -> BatchContext {
    let api =
        ComfyUIApi::with_config(url, Duration::from_secs(10), RetryConfig::immediate(2)).unwrap();
    let workflow = workflow();
    let mapping = ParameterMapping::from_ini(&IniDocument::parse(MAPPING).unwrap(), None)
        .unwrap()
        .resolve(&workflow);
    BatchContext {
        api,
        workflow,
        mapping,
        translator: PromptTranslator::disabled(),
        options,
    }
}

pub fn write_png(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    image::RgbImage::new(4, 4).save(&path).unwrap();
    path
}
