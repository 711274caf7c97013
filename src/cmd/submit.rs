//! Idea submission command: `ideaforge submit`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::json;

use ideaforge::config::ForgeConfig;
use ideaforge::queue::Priority;

pub struct SubmitArgs {
    pub identity: String,
    pub text: String,
    pub priority: Priority,
    pub revision: Option<u32>,
}

pub async fn cmd_submit(project_dir: &Path, server: Option<&str>, args: SubmitArgs) -> Result<()> {
    let base = match server {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => {
            let config = ForgeConfig::new(project_dir.to_path_buf())?;
            let host = match config.toml.server.host.as_str() {
                "0.0.0.0" | "::" => "127.0.0.1",
                host => host,
            };
            format!("http://{}:{}", host, config.server_port())
        }
    };

    let mut body = json!({
        "identity": args.identity,
        "text": args.text,
        "priority": args.priority,
    });
    if let Some(revision) = args.revision {
        body["revisionNumber"] = json!(revision);
    }

    let url = format!("{}/api/ideas", base);
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach ideaforge server at {}", base))?;

    let status = resp.status();
    let reply: serde_json::Value = resp
        .json()
        .await
        .with_context(|| format!("Unexpected response from {}", url))?;

    if !status.is_success() {
        bail!(
            "Submission rejected ({}): {}",
            status,
            reply["error"].as_str().unwrap_or("unknown error")
        );
    }

    println!("Queued task {}", reply["taskId"].as_str().unwrap_or("<unknown>"));
    Ok(())
}
