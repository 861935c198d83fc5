//! Command-line parsing and execution
//!
//! Commands are thin wrappers over `AuthClient`: every backend call goes
//! through the authenticated pipeline, so credential expiry is handled
//! transparently for all of them.

use anyhow::{Context, bail};
use auth_pipeline::AuthClient;
use session::{CATEGORIES_PATH, GROUPS_PATH, LOCATIONS_PATH};
use transport::ApiRequest;

pub const USAGE: &str = "\
usage: geomark [--config PATH] [--metrics] <command>

commands:
  locations | groups | categories   list resources
  get PATH | delete PATH             send a request without body
  post PATH JSON | put PATH JSON | patch PATH JSON
  restore                            obtain an access token from the refresh cookie
  logout                             end the session";

/// Parsed invocation.
#[derive(Debug, PartialEq, Eq)]
pub struct Cli {
    pub config: Option<String>,
    pub metrics: bool,
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Get(String),
    Delete(String),
    Post(String, String),
    Put(String, String),
    Patch(String, String),
    Restore,
    Logout,
}

impl Cli {
    /// Parse arguments (without the program name).
    pub fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut config = None;
        let mut metrics = false;
        let mut rest = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => {
                    let path = iter.next().context("--config requires a path")?;
                    config = Some(path.clone());
                }
                "--metrics" => metrics = true,
                _ => rest.push(arg.as_str()),
            }
        }

        let command = match rest.as_slice() {
            ["locations"] => Command::Get(LOCATIONS_PATH.to_string()),
            ["groups"] => Command::Get(GROUPS_PATH.to_string()),
            ["categories"] => Command::Get(CATEGORIES_PATH.to_string()),
            ["get", path] => Command::Get(api_path(path)),
            ["delete", path] => Command::Delete(api_path(path)),
            ["post", path, body] => Command::Post(api_path(path), body.to_string()),
            ["put", path, body] => Command::Put(api_path(path), body.to_string()),
            ["patch", path, body] => Command::Patch(api_path(path), body.to_string()),
            ["restore"] => Command::Restore,
            ["logout"] => Command::Logout,
            [] => bail!("missing command\n\n{USAGE}"),
            other => bail!("unrecognized command: {}\n\n{USAGE}", other.join(" ")),
        };

        Ok(Self {
            config,
            metrics,
            command,
        })
    }
}

/// Accept `locations/3` as shorthand for `/api/v1/locations/3`.
fn api_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", session::API_PREFIX, path)
    }
}

/// Run a command; returns the text to print on stdout, if any.
pub async fn run(client: &AuthClient, command: Command) -> anyhow::Result<Option<String>> {
    let request = match command {
        Command::Get(path) => ApiRequest::get(path),
        Command::Delete(path) => ApiRequest::delete(path),
        Command::Post(path, body) => ApiRequest::post(path).json(&parse_body(&body)?)?,
        Command::Put(path, body) => ApiRequest::put(path).json(&parse_body(&body)?)?,
        Command::Patch(path, body) => ApiRequest::patch(path).json(&parse_body(&body)?)?,
        Command::Restore => {
            client.restore_session().await?;
            return Ok(Some("session restored".to_string()));
        }
        Command::Logout => {
            client.logout().await?;
            return Ok(Some("logged out".to_string()));
        }
    };

    let response = client.send(request).await?;
    if response.body.is_empty() {
        return Ok(None);
    }
    let rendered = match response.json::<serde_json::Value>() {
        Ok(value) => serde_json::to_string_pretty(&value)?,
        Err(_) => response.text(),
    };
    Ok(Some(rendered))
}

fn parse_body(body: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(body).context("request body must be valid JSON")
}
