use bomwatch_model::{AssemblyKey, MachineInfo, UNKNOWN_PROJECT_ID, UNKNOWN_PROJECT_NAME};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::UnknownProjectPolicy;
use crate::directory::MachineDirectory;
use crate::source::DocumentSource;

pub const MACHINE_ID_PROPERTY: &str = "MachineDB_ID";
pub const OPERATION_PROPERTY: &str = "OP";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectIdentity {
    pub project_id: Option<String>,
    /// Project that sequences version history: the filename code or the
    /// placeholder, never the directory's, so a directory outage cannot move
    /// an assembly to another key.
    pub key_project: Option<String>,
    pub project_name: Option<String>,
    pub machine_id: Option<i64>,
    /// Directory record, when the lookup found one.
    pub machine: Option<MachineInfo>,
    pub declared_op: Option<String>,
    pub placeholder: bool,
    /// Set by the `ignore` policy: sessions are still tracked but the BOM of
    /// this file is not versioned.
    pub ignored: bool,
}

impl ProjectIdentity {
    pub fn assembly_key(&self, path: &str) -> AssemblyKey {
        AssemblyKey::new(self.key_project.clone(), self.machine_id, path)
    }

    pub fn machine_label(&self) -> Option<String> {
        match (&self.machine, self.machine_id) {
            (Some(machine), _) => Some(match &machine.operation_number {
                Some(op) => format!("{} ({})", machine.name, display_op(op)),
                None => machine.name.clone(),
            }),
            (None, Some(id)) => Some(format!("Machine {}", id)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionSignal {
    OpMismatch {
        machine_id: i64,
        declared: String,
        recorded: String,
    },
    MachineNotFound {
        machine_id: i64,
    },
    DirectoryUnavailable {
        machine_id: i64,
        error: String,
    },
    InvalidMachineId {
        raw: String,
    },
    UnresolvedProject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub identity: ProjectIdentity,
    pub signals: Vec<ResolutionSignal>,
}

pub struct ProjectMachineResolver {
    patterns: Vec<Regex>,
    policy: UnknownProjectPolicy,
    source: Arc<dyn DocumentSource>,
    directory: Arc<dyn MachineDirectory>,
}

impl ProjectMachineResolver {
    pub fn new(
        patterns: Vec<Regex>,
        policy: UnknownProjectPolicy,
        source: Arc<dyn DocumentSource>,
        directory: Arc<dyn MachineDirectory>,
    ) -> Self {
        Self {
            patterns,
            policy,
            source,
            directory,
        }
    }

    /// Resolves a document to its project/machine identity. Never fails:
    /// every lookup problem degrades to a smaller identity plus a signal.
    pub fn resolve(&self, path: &str) -> Resolution {
        let mut signals = Vec::new();
        let filename_project = project_code_from_filename(&self.patterns, path);
        let mut identity = ProjectIdentity {
            project_id: filename_project.clone(),
            key_project: filename_project,
            ..ProjectIdentity::default()
        };

        let raw_machine_id = self.read_property(path, MACHINE_ID_PROPERTY);
        identity.declared_op = self.read_property(path, OPERATION_PROPERTY);

        if let Some(raw) = raw_machine_id {
            match raw.parse::<i64>() {
                Ok(machine_id) => {
                    identity.machine_id = Some(machine_id);
                    self.enrich_from_directory(&mut identity, machine_id, &mut signals);
                }
                Err(_) => {
                    warn!(path, raw = %raw, "Ignoring non-numeric machine id property");
                    signals.push(ResolutionSignal::InvalidMachineId { raw });
                }
            }
        }

        if identity.project_id.is_none() && identity.machine_id.is_none() {
            signals.push(ResolutionSignal::UnresolvedProject);
            apply_unknown_policy(self.policy, path, &mut identity);
        }

        debug!(
            path,
            project_id = ?identity.project_id,
            machine_id = ?identity.machine_id,
            signals = signals.len(),
            "Resolved document identity"
        );
        Resolution { identity, signals }
    }

    fn read_property(&self, path: &str, name: &str) -> Option<String> {
        match self.source.read_custom_property(path, name) {
            Ok(value) => value,
            Err(err) => {
                warn!(path, property = name, error = %err, "Failed to read document property");
                None
            }
        }
    }

    fn enrich_from_directory(
        &self,
        identity: &mut ProjectIdentity,
        machine_id: i64,
        signals: &mut Vec<ResolutionSignal>,
    ) {
        let machine = match self.directory.get_machine(machine_id) {
            Ok(Some(machine)) => machine,
            Ok(None) => {
                debug!(machine_id, "Machine not found in directory; using minimal identity");
                signals.push(ResolutionSignal::MachineNotFound { machine_id });
                return;
            }
            Err(err) => {
                warn!(machine_id, error = %err, "Machine directory lookup failed");
                signals.push(ResolutionSignal::DirectoryUnavailable {
                    machine_id,
                    error: err.to_string(),
                });
                return;
            }
        };

        if let (Some(declared), Some(recorded)) =
            (identity.declared_op.as_deref(), machine.operation_number.as_deref())
        {
            if !operations_match(declared, recorded) {
                signals.push(ResolutionSignal::OpMismatch {
                    machine_id,
                    declared: declared.to_string(),
                    recorded: recorded.to_string(),
                });
            }
        }

        if identity.project_id.is_none() {
            identity.project_id = machine.project_id.clone();
        }
        identity.project_name = machine.project_name.clone();
        identity.machine = Some(machine);
    }
}

fn apply_unknown_policy(policy: UnknownProjectPolicy, path: &str, identity: &mut ProjectIdentity) {
    match policy {
        UnknownProjectPolicy::CreatePlaceholder => {
            debug!(path, "No project resolved; using placeholder project");
            identity.project_id = Some(UNKNOWN_PROJECT_ID.to_string());
            identity.key_project = Some(UNKNOWN_PROJECT_ID.to_string());
            identity.project_name = Some(UNKNOWN_PROJECT_NAME.to_string());
            identity.placeholder = true;
        }
        UnknownProjectPolicy::Ignore => {
            debug!(path, "No project resolved; file ignored for versioning");
            identity.ignored = true;
        }
        UnknownProjectPolicy::LogOnly => {
            warn!(path, "No project resolved for document");
        }
    }
}

fn display_op(op: &str) -> String {
    let op = op.trim();
    if op.to_ascii_uppercase().starts_with("OP") {
        op.to_string()
    } else {
        format!("OP {}", op)
    }
}

/// "OP20", "op 20" and "20" all name the same operation.
fn operations_match(declared: &str, recorded: &str) -> bool {
    normalize_op(declared) == normalize_op(recorded)
}

fn normalize_op(value: &str) -> String {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    let digits = compact.trim_start_matches("OP");
    digits.trim_start_matches('0').to_string()
}

pub fn project_code_from_filename(patterns: &[Regex], path: &str) -> Option<String> {
    let file_name = file_name(path);
    patterns.iter().find_map(|pattern| {
        let captures = pattern.captures(file_name)?;
        let matched = captures.get(1).or_else(|| captures.get(0))?;
        let code = matched.as_str().trim();
        (!code.is_empty()).then(|| code.to_string())
    })
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
