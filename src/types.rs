use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of one tailable origin. Two sources are the same source iff all
/// four fields match.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct SourceId {
    pub node: String,
    /// `namespace/pod`
    pub pod: String,
    pub container: String,
    pub path: String,
}

impl SourceId {
    pub fn new(node: &str, namespace: &str, pod: &str, container: &str, path: &str) -> Self {
        Self {
            node: node.to_string(),
            pod: format!("{}/{}", namespace, pod),
            container: container.to_string(),
            path: path.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.pod.split_once('/').map(|(ns, _)| ns).unwrap_or("")
    }

    pub fn pod_name(&self) -> &str {
        self.pod
            .split_once('/')
            .map(|(_, pod)| pod)
            .unwrap_or(&self.pod)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.node, self.pod, self.container)
    }
}

/// One line as produced by a tail backend, before it is stamped with its
/// source and sequence number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Line {
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl Line {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub source: Arc<SourceId>,
    /// Monotonic per source, starting at 1.
    pub seq: u64,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Open,
    Exhausted,
    Failed,
    Closed,
}

/// Verbs checked against the `pods/log` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Watch,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workload reference such as `deployment/web` or a bare pod name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub kind: Option<String>,
    pub name: String,
}

impl ResourceSpec {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        match spec.split_once('/') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    kind: Some(kind.to_lowercase()),
                    name: name.to_string(),
                })
            }
            Some(_) => anyhow::bail!("expected <kind>/<name>, got '{}'", spec),
            None if spec.is_empty() => anyhow::bail!("empty resource"),
            None => Ok(Self {
                kind: None,
                name: spec.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("pod")
    }
}

/// Where a tail starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TailFrom {
    #[default]
    Beginning,
    End,
    Last(usize),
}

impl TailFrom {
    /// `--tail` semantics: negative means everything, otherwise the last N.
    pub fn from_tail_lines(tail: Option<i64>) -> Self {
        match tail {
            Some(n) if n >= 0 => TailFrom::Last(n as usize),
            _ => TailFrom::Beginning,
        }
    }
}
