//! Thin client for the daemon's HTTP facade, used by the operator subcommands.

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use console::style;
use reqwest::{Client, Method};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::core::config::ApiConfig;
use crate::core::reconciler::StatusReport;
use crate::core::store::StateStore;
use crate::core::terminal::{
    format_uptime, print_info, print_link, print_status, print_success, print_warn,
};

pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl ApiClient {
    pub fn new(api: &ApiConfig) -> Self {
        // A wildcard bind is reached through loopback
        let host = match api.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        Self {
            base_url: format!("http://{}:{}", host, api.port),
            token: api.token.clone().filter(|t| !t.is_empty()),
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        let status = res.status();
        let json: Value = res
            .json()
            .await
            .map_err(|e| anyhow!("unexpected response from daemon ({}): {}", status, e))?;
        if json["success"] == Value::Bool(false) {
            let msg = json["error"].as_str().unwrap_or("request failed");
            bail!("{}", msg);
        }
        Ok(json)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.call(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.call(Method::POST, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.call(Method::DELETE, path, None).await
    }
}

/// Whether `err` means nothing is listening on the API port.
pub(crate) fn is_daemon_down(err: &anyhow::Error) -> bool {
    err.downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_connect())
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}

pub(crate) fn print_status_report(status: &Value) {
    print_status("Account", text(status, "active_account"));
    print_status("Repository", text(status, "active_repo"));
    print_status("State", text(status, "run_state"));
    if let Some(run_id) = status["active_run_id"].as_u64() {
        print_status("Run", &run_id.to_string());
    }
    match status["current_session_url"].as_str() {
        Some(url) => print_link("Session", url),
        None => print_status("Session", "-"),
    }
    let uptime = status["uptime_secs"]
        .as_i64()
        .map(format_uptime)
        .unwrap_or_else(|| "-".to_string());
    print_status("Uptime", &uptime);
    print_status(
        "Restarts",
        &status["restart_count"].as_u64().unwrap_or(0).to_string(),
    );
    if let Some(reason) = status["last_restart_reason"].as_str() {
        print_status("Last restart", reason);
    }
    if let Some(action) = status["last_action"].as_str() {
        print_status("Last action", action);
    }
    if let Some(err) = status["last_error"].as_str() {
        print_status("Last error", &style(err).red().to_string());
    }
    if status["auto_dispatch"] == Value::Bool(false) {
        print_warn("Automatic dispatch is off; run `vmkeeper start` to arm it.");
    }
}

/// Live status from the daemon, or the last saved state when it is not running.
pub async fn show_status(client: &ApiClient, data_dir: &Path) -> Result<()> {
    match client.get("/api/status").await {
        Ok(json) => {
            print_status_report(&json["status"]);
            Ok(())
        }
        Err(e) if is_daemon_down(&e) => {
            print_warn("Daemon is not running; showing the last saved state.");
            let state = StateStore::in_dir(data_dir).load()?;
            let report = serde_json::to_value(StatusReport::from_state(&state, Utc::now()))?;
            print_status_report(&report);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub async fn show_history(client: &ApiClient, limit: usize) -> Result<()> {
    let json = client.get(&format!("/api/history?limit={}", limit)).await?;
    let history = &json["history"];

    println!("\n {}", style("Runs").bold());
    match history["runs"].as_array() {
        Some(runs) if !runs.is_empty() => {
            for run in runs {
                println!(
                    "  #{} {} {} {}",
                    run["id"].as_u64().unwrap_or(0),
                    text(run, "status"),
                    run["conclusion"].as_str().unwrap_or(""),
                    style(text(run, "created_at")).dim()
                );
            }
        }
        _ => println!("  {}", style("none").dim()),
    }

    println!("\n {}", style("Sessions").bold());
    match history["sessions"].as_array() {
        Some(sessions) if !sessions.is_empty() => {
            for session in sessions {
                println!(
                    "  {} run #{} {}",
                    style(text(session, "url")).cyan(),
                    session["run_id"].as_u64().unwrap_or(0),
                    style(text(session, "discovered_at")).dim()
                );
            }
        }
        _ => println!("  {}", style("none").dim()),
    }
    println!();
    Ok(())
}

pub async fn start(client: &ApiClient) -> Result<()> {
    let json = client.post("/api/workflow/start", None).await?;
    if json["outcome"] == "already_running" {
        print_info("A run is already being kept alive.");
    } else {
        print_success("Workflow started.");
    }
    Ok(())
}

pub async fn stop(client: &ApiClient) -> Result<()> {
    client.post("/api/workflow/stop", None).await?;
    print_success("Workflow stopped; automatic dispatch is off.");
    Ok(())
}

pub async fn restart(client: &ApiClient, reason: Option<String>) -> Result<()> {
    let body = reason.map(|r| serde_json::json!({ "reason": r }));
    client.post("/api/workflow/restart", body).await?;
    print_success("Workflow restarted.");
    Ok(())
}

pub async fn list_repositories(client: &ApiClient, limit: usize) -> Result<()> {
    let json = client
        .get(&format!("/api/repositories?limit={}", limit))
        .await?;
    let repos = json["repositories"].as_array().cloned().unwrap_or_default();
    if repos.is_empty() {
        print_info("No repositories yet. Create one with `vmkeeper repo create`.");
        return Ok(());
    }
    for repo in &repos {
        let visibility = if repo["private"] == Value::Bool(true) {
            style(" (private)").dim().to_string()
        } else {
            String::new()
        };
        println!(
            "  {}{} {}",
            style(text(repo, "full_name")).cyan(),
            visibility,
            style(repo["description"].as_str().unwrap_or("")).dim()
        );
    }
    Ok(())
}

pub async fn create_repository(client: &ApiClient, name: Option<&str>) -> Result<()> {
    let body = name.map(|n| serde_json::json!({ "name": n }));
    let json = client.post("/api/repositories", body).await?;
    print_success(&format!(
        "Created {} with the worker workflow; it is now the active repository.",
        text(&json, "repository")
    ));
    Ok(())
}

pub async fn push_workflow(client: &ApiClient, content: Option<String>) -> Result<()> {
    let body = content.map(|c| serde_json::json!({ "content": c }));
    let json = client.post("/api/repository/workflow", body).await?;
    print_success(&format!("Pushed {}", text(&json, "path")));
    print_info("Run `vmkeeper start` if the keeper is waiting on a missing workflow.");
    Ok(())
}

pub async fn reset_counters(client: &ApiClient) -> Result<()> {
    client.post("/api/counters/reset", None).await?;
    print_success("Restart counters reset.");
    Ok(())
}

pub async fn add_account(client: &ApiClient, token: &str) -> Result<()> {
    let json = client
        .post(
            "/api/accounts",
            Some(serde_json::json!({ "token": token })),
        )
        .await?;
    let account = &json["account"];
    print_success(&format!("Added account {}", text(account, "id")));
    if account["is_active"] == Value::Bool(true) {
        print_info("It is now the active account.");
    }
    Ok(())
}

pub async fn list_accounts(client: &ApiClient) -> Result<()> {
    let json = client.get("/api/accounts").await?;
    let accounts = json["accounts"].as_array().cloned().unwrap_or_default();
    if accounts.is_empty() {
        print_info("No accounts yet. Add one with `vmkeeper account add <token>`.");
        return Ok(());
    }
    for account in &accounts {
        let marker = if account["is_active"] == Value::Bool(true) {
            style("*").green().bold().to_string()
        } else {
            " ".to_string()
        };
        let owner = if account["is_owner"] == Value::Bool(true) {
            style(" (owner)").dim().to_string()
        } else {
            String::new()
        };
        println!(" {} {}{}", marker, text(account, "id"), owner);
    }
    Ok(())
}

pub async fn switch_account(client: &ApiClient, id: &str) -> Result<()> {
    client
        .post(&format!("/api/accounts/{}/activate", id), None)
        .await?;
    print_success(&format!("Active account is now {}", id));
    Ok(())
}

pub async fn remove_account(client: &ApiClient, id: &str) -> Result<()> {
    client.delete(&format!("/api/accounts/{}", id)).await?;
    print_success(&format!("Removed account {}", id));
    Ok(())
}

pub async fn select_repository(client: &ApiClient, full_name: &str) -> Result<()> {
    client
        .post(
            "/api/repository",
            Some(serde_json::json!({ "full_name": full_name })),
        )
        .await?;
    print_success(&format!("Active repository is now {}", full_name.trim()));
    Ok(())
}
