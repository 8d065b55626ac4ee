use std::env;
use std::fs;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use appdepot_core::version::is_newer_version;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::Value;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let api = match ApiClient::from_env() {
        Ok(api) => api,
        Err(err) => {
            eprintln!("error: {}", err);
            return;
        }
    };

    let result = match args[1].as_str() {
        "settings" => api.settings(),
        "list" => {
            if args.len() < 3 {
                print_usage();
                return;
            }
            api.list(&args[2..])
        }
        "get" => match (args.get(2), args.get(3)) {
            (Some(id), Some(account)) => api.get(id, account),
            _ => {
                print_usage();
                return;
            }
        },
        "add" => match args.get(2) {
            Some(path) => api.add(path),
            None => {
                print_usage();
                return;
            }
        },
        "pause" => run_with_id(&api, &args, |api, id| api.pause(id)),
        "resume" => run_with_id(&api, &args, |api, id| api.resume(id)),
        "delete" => run_with_id(&api, &args, |api, id| api.delete(id)),
        "watch" => run_with_id(&api, &args, |api, id| api.watch(id)),
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(err) = result {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run_with_id<F>(api: &ApiClient, args: &[String], f: F) -> Result<(), String>
where
    F: FnOnce(&ApiClient, &str) -> Result<(), String>,
{
    match args.get(2) {
        Some(id) => f(api, id),
        None => {
            print_usage();
            Ok(())
        }
    }
}

struct ApiClient {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl ApiClient {
    fn from_env() -> Result<Self, String> {
        let base_url = env::var("APPDEPOT_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string())
            .trim_end_matches('/')
            .to_string();
        let token = env::var("APPDEPOT_TOKEN").ok().filter(|t| !t.is_empty());
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| err.to_string())?;
        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn send(&self, builder: RequestBuilder) -> Result<Value, String> {
        let resp = self.authed(builder).send().map_err(|err| err.to_string())?;
        let status = resp.status();
        let text = resp.text().map_err(|err| err.to_string())?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if !status.is_success() {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or(status.as_str());
            return Err(message.to_string());
        }
        Ok(value)
    }

    fn settings(&self) -> Result<(), String> {
        let value = self.send(self.client.get(format!("{}/api/settings", self.base_url)))?;
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        Ok(())
    }

    fn list(&self, account_hashes: &[String]) -> Result<(), String> {
        let joined = account_hashes.join(",");
        let value = self.send(self.client.get(format!(
            "{}/api/downloads?accountHashes={}",
            self.base_url, joined
        )))?;
        let tasks = value.as_array().cloned().unwrap_or_default();
        if tasks.is_empty() {
            println!("no downloads");
            return Ok(());
        }
        for task in &tasks {
            println!("{}", format_task_line(task, &tasks));
        }
        Ok(())
    }

    fn get(&self, id: &str, account_hash: &str) -> Result<(), String> {
        let value = self.send(self.client.get(format!(
            "{}/api/downloads/{}?accountHash={}",
            self.base_url, id, account_hash
        )))?;
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        Ok(())
    }

    fn add(&self, path: &str) -> Result<(), String> {
        let body = fs::read_to_string(path).map_err(|err| err.to_string())?;
        let parsed: Value = serde_json::from_str(&body).map_err(|err| err.to_string())?;
        let value = self.send(
            self.client
                .post(format!("{}/api/downloads", self.base_url))
                .json(&parsed),
        )?;
        let id = value.get("id").and_then(Value::as_str).unwrap_or("?");
        println!("created task: {}", id);
        Ok(())
    }

    fn pause(&self, id: &str) -> Result<(), String> {
        self.send(
            self.client
                .post(format!("{}/api/downloads/{}/pause", self.base_url, id)),
        )?;
        println!("paused {}", id);
        Ok(())
    }

    fn resume(&self, id: &str) -> Result<(), String> {
        self.send(
            self.client
                .post(format!("{}/api/downloads/{}/resume", self.base_url, id)),
        )?;
        println!("resumed {}", id);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), String> {
        self.send(
            self.client
                .delete(format!("{}/api/downloads/{}", self.base_url, id)),
        )?;
        println!("deleted {}", id);
        Ok(())
    }

    /// Follow the task's event stream, printing one line per update.
    fn watch(&self, id: &str) -> Result<(), String> {
        let client = Client::builder()
            .timeout(None)
            .build()
            .map_err(|err| err.to_string())?;
        let mut builder = client.get(format!(
            "{}/api/downloads/{}/progress",
            self.base_url, id
        ));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let resp: Response = builder.send().map_err(|err| err.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("stream returned {}", resp.status()));
        }
        let reader = BufReader::new(resp);
        for line in reader.lines() {
            let line = line.map_err(|err| err.to_string())?;
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(task) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let status = task.get("status").and_then(Value::as_str).unwrap_or("?");
            let progress = task.get("progress").and_then(Value::as_u64).unwrap_or(0);
            let speed = task.get("speed").and_then(Value::as_str).unwrap_or("");
            println!("[{}] {}% {}", status, progress, speed);
            if matches!(status, "completed" | "failed") {
                break;
            }
        }
        Ok(())
    }
}

/// One line per task; completed versions that a newer completed download of
/// the same bundle replaces are flagged as superseded.
fn format_task_line(task: &Value, all: &[Value]) -> String {
    let id = task.get("id").and_then(Value::as_str).unwrap_or("?");
    let status = task.get("status").and_then(Value::as_str).unwrap_or("?");
    let name = task
        .pointer("/software/name")
        .and_then(Value::as_str)
        .unwrap_or("?");
    let bundle = task
        .pointer("/software/bundleID")
        .and_then(Value::as_str)
        .unwrap_or("?");
    let version = task
        .pointer("/software/version")
        .and_then(Value::as_str)
        .unwrap_or("0");

    let superseded = all.iter().any(|other| {
        other.pointer("/software/bundleID").and_then(Value::as_str) == Some(bundle)
            && other.get("status").and_then(Value::as_str) == Some("completed")
            && other
                .pointer("/software/version")
                .and_then(Value::as_str)
                .map(|other_version| is_newer_version(other_version, version))
                .unwrap_or(false)
    });

    let marker = if superseded { " (superseded)" } else { "" };
    format!("{}\t{}\t{} {} {}{}", id, status, name, bundle, version, marker)
}

fn print_usage() {
    eprintln!(
        "Usage: appdepot-cli <command> [args]\n\
Commands:\n\
  settings                  Show runtime configuration\n\
  list <accountHash...>     List downloads owned by the given accounts\n\
  get <id> <accountHash>    Show one download\n\
  add <request.json>        Create a download from a JSON request file\n\
  pause <id>                Pause an active download\n\
  resume <id>               Resume a paused download\n\
  delete <id>               Delete a download and its file\n\
  watch <id>                Follow a download's progress stream\n\
Environment:\n\
  APPDEPOT_URL              API base URL (default http://127.0.0.1:3000)\n\
  APPDEPOT_TOKEN            Access token when a password gate is enabled"
    );
}
