//! Machine Directory collaborator.

use bomwatch_model::MachineInfo;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{MonitorError, Result};

pub trait MachineDirectory: Send + Sync {
    /// `Ok(None)` means the directory answered and does not know the id.
    fn get_machine(&self, id: i64) -> Result<Option<MachineInfo>>;
}

/// Talks to the machine registry over HTTP: `GET {base}/api/machines/{id}`.
pub struct HttpMachineDirectory {
    client: reqwest::blocking::Client,
    base_url: String,
}

// The registry speaks camelCase; MachineInfo stays snake_case on our side.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineDto {
    id: i64,
    name: String,
    #[serde(default)]
    operation_number: Option<String>,
    #[serde(default)]
    project_id: Option<serde_json::Value>,
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl From<MachineDto> for MachineInfo {
    fn from(dto: MachineDto) -> Self {
        // Project ids come back as numbers from some registry versions.
        let project_id = dto.project_id.and_then(|value| match value {
            serde_json::Value::String(text) => Some(text),
            serde_json::Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        MachineInfo {
            id: dto.id,
            name: dto.name,
            operation_number: dto.operation_number.filter(|op| !op.trim().is_empty()),
            project_id,
            project_name: dto.project_name,
            status: dto.status,
        }
    }
}

impl HttpMachineDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MonitorError::Directory(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn machine_url(&self, id: i64) -> String {
        format!("{}/api/machines/{}", self.base_url, id)
    }
}

impl MachineDirectory for HttpMachineDirectory {
    fn get_machine(&self, id: i64) -> Result<Option<MachineInfo>> {
        let url = self.machine_url(id);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| MonitorError::Directory(format!("failed to reach {url}: {err}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(MonitorError::Directory(format!(
                "machine directory http error {status}: {text}"
            )));
        }

        let dto: MachineDto = response
            .json()
            .map_err(|err| MonitorError::Directory(format!("invalid machine payload: {err}")))?;
        Ok(Some(dto.into()))
    }
}

/// Fixed set of machines; used when no registry is configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticMachineDirectory {
    machines: HashMap<i64, MachineInfo>,
}

impl StaticMachineDirectory {
    pub fn new(machines: impl IntoIterator<Item = MachineInfo>) -> Self {
        Self {
            machines: machines
                .into_iter()
                .map(|machine| (machine.id, machine))
                .collect(),
        }
    }
}

impl MachineDirectory for StaticMachineDirectory {
    fn get_machine(&self, id: i64) -> Result<Option<MachineInfo>> {
        Ok(self.machines.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dto_accepts_numeric_project_ids() {
        let dto: MachineDto = serde_json::from_str(
            r#"{"id":5,"name":"Press 5","operationNumber":"OP20","projectId":1001,"projectName":"Line A","status":"active"}"#,
        )
        .expect("dto");
        let info = MachineInfo::from(dto);
        assert_eq!(info.project_id.as_deref(), Some("1001"));
        assert_eq!(info.operation_number.as_deref(), Some("OP20"));
    }

    #[test]
    fn dto_drops_blank_operation_number() {
        let dto: MachineDto =
            serde_json::from_str(r#"{"id":7,"name":"Mill","operationNumber":" "}"#).expect("dto");
        assert!(MachineInfo::from(dto).operation_number.is_none());
    }

    #[test]
    fn machine_url_strips_trailing_slash() {
        let directory =
            HttpMachineDirectory::new("http://registry.local/", Duration::from_secs(1))
                .expect("client");
        assert_eq!(
            directory.machine_url(5),
            "http://registry.local/api/machines/5"
        );
    }

    #[test]
    fn static_directory_returns_none_for_unknown_ids() {
        let directory = StaticMachineDirectory::new(vec![MachineInfo {
            id: 1,
            name: "Lathe".to_string(),
            operation_number: None,
            project_id: None,
            project_name: None,
            status: None,
        }]);
        assert!(directory.get_machine(1).expect("lookup").is_some());
        assert!(directory.get_machine(5).expect("lookup").is_none());
    }
}
