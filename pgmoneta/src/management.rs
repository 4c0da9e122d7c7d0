//! Management RPC request/response shapes (spec.md §6). This models the
//! Rust types the core needs to report outcomes through; it does not
//! reimplement the wire framing around them (that's an external
//! collaborator per SPEC_FULL.md's Non-goals notes) — `serde_json` reads
//! one object per request off the Unix-domain socket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Text,
    Json,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub command: String,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub encryption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub header: RequestHeader,
    #[serde(default)]
    pub request: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: bool,
    pub seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub header: RequestHeader,
    pub outcome: Outcome,
    #[serde(default)]
    pub response: serde_json::Value,
}

impl Response {
    pub fn ok(header: RequestHeader, seconds: f64, body: serde_json::Value) -> Self {
        Response {
            header,
            outcome: Outcome { status: true, seconds, error: None },
            response: body,
        }
    }

    pub fn error(header: RequestHeader, seconds: f64, tag: &'static str) -> Self {
        Response {
            header,
            outcome: Outcome { status: false, seconds, error: Some(tag.to_string()) },
            response: serde_json::Value::Null,
        }
    }
}

/// Commands named in spec.md §6. A `pgmoneta-cli`-style command-line
/// translation layer is out of scope (Non-goal); this enum is the
/// dispatch boundary the supervisor's request loop matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Backup,
    ListBackup,
    Restore,
    Verify,
    Archive,
    Delete,
    Retain,
    Expunge,
    Ping,
    Shutdown,
    Status,
    StatusDetails,
    Reload,
    ConfGet,
    ConfLs,
    ConfSet,
    ConfReload,
    ClearPrometheus,
    Info,
    Annotate,
    ModeOnline,
    ModeOffline,
}

impl Command {
    pub fn parse(name: &str) -> Option<Command> {
        Some(match name {
            "backup" => Command::Backup,
            "list-backup" => Command::ListBackup,
            "restore" => Command::Restore,
            "verify" => Command::Verify,
            "archive" => Command::Archive,
            "delete" => Command::Delete,
            "retain" => Command::Retain,
            "expunge" => Command::Expunge,
            "ping" => Command::Ping,
            "shutdown" => Command::Shutdown,
            "status" => Command::Status,
            "status-details" => Command::StatusDetails,
            "reload" => Command::Reload,
            "conf-get" => Command::ConfGet,
            "conf-ls" => Command::ConfLs,
            "conf-set" => Command::ConfSet,
            "conf-reload" => Command::ConfReload,
            "clear-prometheus" => Command::ClearPrometheus,
            "info" => Command::Info,
            "annotate" => Command::Annotate,
            "mode-online" => Command::ModeOnline,
            "mode-offline" => Command::ModeOffline,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let text = r#"{"header":{"command":"backup"},"request":{"server":"primary"}}"#;
        let request: Request = serde_json::from_str(text).unwrap();
        assert_eq!(request.header.command, "backup");
        assert_eq!(request.request["server"], "primary");
    }

    #[test]
    fn error_response_carries_the_tag() {
        let header = RequestHeader {
            command: "backup".into(),
            output_format: None,
            compression: None,
            encryption: None,
        };
        let response = Response::error(header, 0.01, "BACKUP_ACTIVE");
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("BACKUP_ACTIVE"));
        assert!(!response.outcome.status);
    }

    #[test]
    fn unknown_command_is_not_parsed() {
        assert!(Command::parse("not-a-command").is_none());
        assert_eq!(Command::parse("backup"), Some(Command::Backup));
    }
}
