//! End-to-end HTTP surface tests against a real bound listener.

use std::path::PathBuf;
use std::time::Duration;

use sidequest_core::kernel::config::{Config, DopplerSettings, GitSettings};
use sidequest_core::server::app::build_app;
use sidequest_core::server::listener::{bind_with_fallback, BindOptions};
use tempfile::TempDir;
use tokio::net::TcpListener;

fn test_config(dir: &TempDir) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_port: 0,
        health_check_port: None,
        max_concurrent: 4,
        log_level: "info".to_string(),
        app_env: "development".to_string(),
        db_path: dir.path().join("jobs.db"),
        log_dir: dir.path().join("job-logs"),
        repos_root: None,
        cron_schedule: "0 2 * * *".to_string(),
        run_on_startup: false,
        git: GitSettings {
            enabled: false,
            base_branch: "main".to_string(),
            branch_prefix: "automated".to_string(),
            dry_run: false,
        },
        doppler: DopplerSettings {
            token: None,
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 5_000,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            cache_dir: dir.path().join("doppler-cache"),
        },
    }
}

/// Boot the app on a fallback-bound port, returning its base URL.
async fn start_server(dir: &TempDir) -> (String, u16) {
    let (app, _state) = build_app(test_config(dir)).await.expect("app builds");

    // Occupy a port so binding exercises the fallback walk.
    let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let busy = held.local_addr().unwrap().port();
    let opts =
        BindOptions::new(busy, busy.saturating_add(10)).with_host("127.0.0.1".to_string());
    let (listener, port) = bind_with_fallback(&opts).await.expect("a fallback port");
    assert_ne!(port, busy, "fallback should have skipped the held port");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server runs");
    });
    // Keep the blocker alive for the duration of the bind assertion only.
    drop(held);

    (format!("http://127.0.0.1:{port}"), port)
}

async fn wait_for_completed(client: &reqwest::Client, base: &str, pipeline: &str, job_id: &str) {
    for _ in 0..200 {
        let body: serde_json::Value = client
            .get(format!(
                "{base}/api/sidequest/pipeline-runners/{pipeline}/jobs?includeTotal=true&limit=100"
            ))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let done = body["jobs"].as_array().unwrap().iter().any(|job| {
            job["id"] == job_id && (job["status"] == "completed" || job["status"] == "failed")
        });
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} never finished");
}

#[tokio::test]
async fn health_reports_ok_once_booted() {
    let dir = TempDir::new().unwrap();
    let (base, _port) = start_server(&dir).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_pipeline_names_every_supported_id() {
    let dir = TempDir::new().unwrap();
    let (base, _port) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/sidequest/pipeline-runners/nope/trigger"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    let message = body["message"].as_str().unwrap();
    for pipeline in [
        "duplicate-detection",
        "gitignore-update",
        "readme-enhancement",
        "repomix-pack",
    ] {
        assert!(message.contains(pipeline), "{message} missing {pipeline}");
    }
}

#[tokio::test]
async fn trigger_runs_a_job_to_completion() {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("a.txt"), "same").unwrap();
    std::fs::write(repo.join("b.txt"), "same").unwrap();

    let (base, _port) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!(
            "{base}/api/sidequest/pipeline-runners/duplicate-detection/trigger"
        ))
        .json(&serde_json::json!({
            "parameters": {"repositoryPath": repo.to_string_lossy()}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["pipelineId"], "duplicate-detection");
    assert_eq!(body["status"], "queued");
    let job_id = body["jobId"].as_str().unwrap().to_string();

    wait_for_completed(&client, &base, "duplicate-detection", &job_id).await;

    let listing: serde_json::Value = client
        .get(format!(
            "{base}/api/sidequest/pipeline-runners/duplicate-detection/jobs?includeTotal=true"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["hasMore"], false);
    let job = &listing["jobs"][0];
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["duplicate_groups"][0]["files"][0], "a.txt");
}

#[tokio::test]
async fn scan_start_validates_and_accepts() {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    let (base, _port) = start_server(&dir).await;
    let client = reqwest::Client::new();

    // Empty input: 400 with message + timestamp.
    let rejected = client
        .post(format!("{base}/api/scans/start"))
        .json(&serde_json::json!({"repositoryPath": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("repositoryPath"));
    assert!(body.get("timestamp").is_some());

    // Valid input: 201 with a scan id.
    let accepted = client
        .post(format!("{base}/api/scans/start"))
        .json(&serde_json::json!({"repositoryPath": repo.to_string_lossy()}))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 201);
    let body: serde_json::Value = accepted.json().await.unwrap();
    assert!(body["scanId"].as_str().unwrap().starts_with("scan-"));
}

#[tokio::test]
async fn status_lists_every_pipeline() {
    let dir = TempDir::new().unwrap();
    let (base, _port) = start_server(&dir).await;

    let body: serde_json::Value = reqwest::get(format!("{base}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let pipelines = body["pipelines"].as_array().unwrap();
    assert_eq!(pipelines.len(), 4);
    assert!(pipelines.iter().all(|p| p["status"] == "idle"));
    assert_eq!(body["store"]["status"], "healthy");
    assert!(body.get("timestamp").is_some());
    assert_eq!(body["queue"]["active"], 0);
}

#[tokio::test]
async fn unknown_status_filter_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (base, _port) = start_server(&dir).await;

    let response = reqwest::get(format!(
        "{base}/api/sidequest/pipeline-runners/duplicate-detection/jobs?status=exploded"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn job_logs_are_written_on_completion() {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    let (base, _port) = start_server(&dir).await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(format!(
            "{base}/api/sidequest/pipeline-runners/repomix-pack/trigger"
        ))
        .json(&serde_json::json!({
            "parameters": {"repositoryPath": repo.to_string_lossy()}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = body["jobId"].as_str().unwrap().to_string();
    wait_for_completed(&client, &base, "repomix-pack", &job_id).await;

    let log_path: PathBuf = dir
        .path()
        .join("job-logs")
        .join("repomix-pack")
        .join(format!("{job_id}.json"));
    assert!(log_path.exists(), "missing job log at {}", log_path.display());
}
