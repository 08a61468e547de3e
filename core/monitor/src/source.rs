//! Boundary adapter for the CAD application.
//!
//! Core logic only sees [`DocumentSource`]. The shipped implementation shells
//! out to a bridge executable that talks to the modeling application and
//! prints JSON on stdout:
//!
//! - `<bridge> list` → `[{"path", "last_write_time", "type_tag"}]`
//! - `<bridge> property <path> <name>` → `{"value": "..."}` or `{"value": null}`
//! - `<bridge> bom <path>` → `[{"part_number", "description", "quantity", ...}]`
//!
//! Exit code 3 from the bridge means the application itself is not running.

use bomwatch_model::{DocumentInfo, RawBomItem};
use serde::Deserialize;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{MonitorError, Result};

const APP_NOT_RUNNING_EXIT_CODE: i32 = 3;
const CHILD_POLL_INTERVAL_MS: u64 = 25;

pub trait DocumentSource: Send + Sync {
    /// Lists documents currently open in the application. An unreachable
    /// application is a [`MonitorError::TransientSource`].
    fn list_open_documents(&self) -> Result<Vec<DocumentInfo>>;

    fn read_custom_property(&self, path: &str, name: &str) -> Result<Option<String>>;

    /// Extracts the structured BOM of an open assembly. Busy, locked or
    /// invalid documents are a [`MonitorError::Extraction`].
    fn extract_bom(&self, path: &str) -> Result<Vec<RawBomItem>>;
}

#[derive(Debug, Clone)]
pub struct CommandDocumentSource {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    extraction_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PropertyReply {
    #[serde(default)]
    value: Option<String>,
}

impl CommandDocumentSource {
    pub fn new(program: impl Into<String>, base_args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            base_args,
            timeout,
            extraction_timeout: timeout,
        }
    }

    /// Bound for `bom` calls, which may legitimately take far longer than
    /// listings and property reads.
    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    fn run(&self, args: &[&str], timeout: Duration) -> std::result::Result<Output, String> {
        let child = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to spawn bridge {}: {}", self.program, err))?;
        wait_with_output_timeout(child, timeout)
    }
}

impl DocumentSource for CommandDocumentSource {
    fn list_open_documents(&self) -> Result<Vec<DocumentInfo>> {
        let output = self.run(&["list"], self.timeout).map_err(MonitorError::TransientSource)?;
        if output.status.code() == Some(APP_NOT_RUNNING_EXIT_CODE) {
            return Err(MonitorError::TransientSource(
                "modeling application is not running".to_string(),
            ));
        }
        if !output.status.success() {
            return Err(MonitorError::TransientSource(failure_message(&output)));
        }
        serde_json::from_slice(&output.stdout).map_err(|err| {
            MonitorError::TransientSource(format!("bridge returned invalid listing: {}", err))
        })
    }

    fn read_custom_property(&self, path: &str, name: &str) -> Result<Option<String>> {
        let output = self
            .run(&["property", path, name], self.timeout)
            .map_err(MonitorError::TransientSource)?;
        if !output.status.success() {
            return Err(MonitorError::TransientSource(failure_message(&output)));
        }
        let reply: PropertyReply = serde_json::from_slice(&output.stdout).map_err(|err| {
            MonitorError::TransientSource(format!("bridge returned invalid property: {}", err))
        })?;
        Ok(reply
            .value
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    fn extract_bom(&self, path: &str) -> Result<Vec<RawBomItem>> {
        let output = self
            .run(&["bom", path], self.extraction_timeout)
            .map_err(|err| MonitorError::extraction(path, err))?;
        if !output.status.success() {
            return Err(MonitorError::extraction(path, failure_message(&output)));
        }
        serde_json::from_slice(&output.stdout).map_err(|err| {
            MonitorError::extraction(path, format!("bridge returned invalid BOM: {}", err))
        })
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    match output.status.code() {
        Some(code) => format!("bridge exited with {}: {}", code, stderr.trim()),
        None => format!("bridge terminated by signal: {}", stderr.trim()),
    }
}

fn wait_with_output_timeout(
    mut child: std::process::Child,
    timeout: Duration,
) -> std::result::Result<Output, String> {
    // Drain pipes on helper threads so a chatty bridge cannot block on a full
    // pipe while we wait for it to exit.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => return Err(format!("failed to poll bridge status: {}", err)),
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("bridge timed out after {}s", timeout.as_secs()));
        }
        thread::sleep(Duration::from_millis(CHILD_POLL_INTERVAL_MS));
    };

    Ok(Output {
        status,
        stdout: stdout.map(join_reader).unwrap_or_default(),
        stderr: stderr.map(join_reader).unwrap_or_default(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_source(body: &str, timeout: Duration) -> CommandDocumentSource {
        CommandDocumentSource::new(
            "/bin/sh",
            vec!["-c".to_string(), body.to_string(), "bridge".to_string()],
            timeout,
        )
    }

    #[test]
    fn lists_documents_from_bridge_json() {
        let source = shell_source(
            r#"echo '[{"path":"C:/w/Gearbox.iam","last_write_time":"2026-03-01T10:00:00Z","type_tag":"kAssemblyDocumentObject"}]'"#,
            Duration::from_secs(5),
        );

        let docs = source.list_open_documents().expect("listing");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "C:/w/Gearbox.iam");
        assert_eq!(docs[0].type_tag.as_deref(), Some("kAssemblyDocumentObject"));
    }

    #[test]
    fn exit_code_three_is_transient() {
        let source = shell_source("exit 3", Duration::from_secs(5));

        let err = source.list_open_documents().expect_err("not running");
        assert!(matches!(err, MonitorError::TransientSource(_)));
    }

    #[test]
    fn blank_property_value_is_none() {
        let source = shell_source(r#"echo '{"value":"  "}'"#, Duration::from_secs(5));

        let value = source
            .read_custom_property("/w/a.iam", "OP")
            .expect("property");
        assert!(value.is_none());
    }

    #[test]
    fn bom_calls_use_the_extraction_timeout() {
        let source = shell_source("sleep 0.4; echo '[]'", Duration::from_millis(100))
            .with_extraction_timeout(Duration::from_secs(5));

        let items = source.extract_bom("/w/a.iam").expect("bom");
        assert!(items.is_empty());

        let err = source.list_open_documents().expect_err("listing timeout");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn failed_bom_extraction_is_extraction_error() {
        let source = shell_source("echo 'document locked' >&2; exit 1", Duration::from_secs(5));

        let err = source.extract_bom("/w/a.iam").expect_err("locked");
        match err {
            MonitorError::Extraction { path, reason } => {
                assert_eq!(path, "/w/a.iam");
                assert!(reason.contains("document locked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn slow_bridge_times_out() {
        let source = shell_source("sleep 5", Duration::from_millis(200));

        let err = source.extract_bom("/w/a.iam").expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }
}
