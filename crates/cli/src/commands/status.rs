use std::process::ExitCode;

use anyhow::Context;
use serde_json::Value;

use comfybatch_pipeline::context::api_from_settings;
use comfybatch_pipeline::settings::Settings;
use comfybatch_pipeline::translate::OllamaTranslator;

pub async fn execute(settings: &Settings) -> anyhow::Result<ExitCode> {
    let api = api_from_settings(settings)?;
    println!("ComfyUI: {}", api.api_url());

    let stats = api
        .system_stats()
        .await
        .with_context(|| format!("ComfyUI server at {} is not reachable", api.api_url()))?;
    for line in describe_stats(&stats) {
        println!("  {line}");
    }

    match api.queue().await {
        Ok(queue) => {
            let (running, pending) = queue_lengths(&queue);
            println!("  queue: {running} running, {pending} pending");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to read queue"),
    }

    if !settings.ollama.enable {
        println!("Translation: disabled");
        return Ok(ExitCode::SUCCESS);
    }

    let ollama = OllamaTranslator::from_settings(&settings.ollama)?;
    println!("Translation: ollama at {} (model {})", settings.ollama.url, ollama.model());
    match ollama.list_models().await {
        Ok(models) => {
            // Ollama reports `llama3:latest` for a bare `llama3`.
            let wanted = ollama.model();
            let installed = models
                .iter()
                .any(|m| m.name == wanted || m.name.split(':').next() == Some(wanted));
            for model in &models {
                println!("  {}", model.name);
            }
            if !installed {
                println!("  warning: model {} is not installed", ollama.model());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("  unreachable: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn describe_stats(stats: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    let system = &stats["system"];
    if let Some(version) = system["comfyui_version"].as_str() {
        lines.push(format!("version: {version}"));
    }
    if let Some(os) = system["os"].as_str() {
        lines.push(format!("os: {os}"));
    }
    for device in stats["devices"].as_array().into_iter().flatten() {
        let name = device["name"].as_str().unwrap_or("unknown device");
        match (device["vram_free"].as_u64(), device["vram_total"].as_u64()) {
            (Some(free), Some(total)) => lines.push(format!(
                "device: {name} ({} / {} MiB free)",
                free >> 20,
                total >> 20
            )),
            _ => lines.push(format!("device: {name}")),
        }
    }
    lines
}

fn queue_lengths(queue: &Value) -> (usize, usize) {
    let len = |key: &str| queue[key].as_array().map_or(0, Vec::len);
    (len("queue_running"), len("queue_pending"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stats_lines() {
        let stats = json!({
            "system": {"os": "posix", "comfyui_version": "0.3.10"},
            "devices": [{"name": "cuda:0 RTX", "vram_total": 8_589_934_592u64, "vram_free": 4_294_967_296u64}]
        });
        assert_eq!(
            describe_stats(&stats),
            ["version: 0.3.10", "os: posix", "device: cuda:0 RTX (4096 / 8192 MiB free)"]
        );
    }

    #[test]
    fn queue_counts_tolerate_missing_keys() {
        assert_eq!(queue_lengths(&json!({"queue_running": [[0, "a"]]})), (1, 0));
    }
}
