use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeLocation {
    pub from: String,
    pub from_port: usize,
    pub to: String,
    pub to_port: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<EdgeLocation>,
}

impl Diagnostic {
    pub fn new(rule: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_edge(mut self, edge: &crate::Edge) -> Self {
        self.edge = Some(EdgeLocation {
            from: edge.from.clone(),
            from_port: edge.from_port,
            to: edge.to.clone(),
            to_port: edge.to_port,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{level}[{}]", self.rule)?;
        if let Some(node_id) = self.node_id.as_deref() {
            write!(f, " node '{node_id}'")?;
        }
        if let Some(edge) = self.edge.as_ref() {
            write!(
                f,
                " edge {}:{} -> {}:{}",
                edge.from, edge.from_port, edge.to, edge.to_port
            )?;
        }
        write!(f, ": {}", self.message)
    }
}
