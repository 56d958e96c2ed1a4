use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default number of workflows released per ramp batch.
const DEFAULT_RAMP_BATCH: u32 = 10;

/// Default delay between ramp batches in seconds.
const DEFAULT_RAMP_DELAY: f64 = 1.0;

/// Screen coordinates for a step. Rows and columns are 1-based;
/// `row == 0 && column == 0` means "at the current cursor position".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Coordinates {
    pub row: u32,
    pub column: u32,
    pub length: u32,
}

/// The action a single workflow step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Connect,
    Disconnect,
    FillString,
    CheckValue,
    AsciiScreenGrab,
    WaitForField,
    PressEnter,
    PressTab,
    /// Program function key, 1..=24.
    PressPf(u8),
    HumanDelay,
    InitializeOutput,
}

impl FromStr for StepKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "Connect" => Self::Connect,
            "Disconnect" => Self::Disconnect,
            "FillString" => Self::FillString,
            "CheckValue" => Self::CheckValue,
            "AsciiScreenGrab" => Self::AsciiScreenGrab,
            "WaitForField" => Self::WaitForField,
            "PressEnter" => Self::PressEnter,
            "PressTab" => Self::PressTab,
            "HumanDelay" => Self::HumanDelay,
            "InitializeOutput" => Self::InitializeOutput,
            other => {
                let Some(n) = other
                    .strip_prefix("PressPF")
                    .and_then(|n| n.parse::<u8>().ok())
                else {
                    bail!("unknown step type: {other}");
                };
                if !(1..=24).contains(&n) {
                    bail!("unknown step type: {other}");
                }
                Self::PressPf(n)
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("Connect"),
            Self::Disconnect => f.write_str("Disconnect"),
            Self::FillString => f.write_str("FillString"),
            Self::CheckValue => f.write_str("CheckValue"),
            Self::AsciiScreenGrab => f.write_str("AsciiScreenGrab"),
            Self::WaitForField => f.write_str("WaitForField"),
            Self::PressEnter => f.write_str("PressEnter"),
            Self::PressTab => f.write_str("PressTab"),
            Self::PressPf(n) => write!(f, "PressPF{n}"),
            Self::HumanDelay => f.write_str("HumanDelay"),
            Self::InitializeOutput => f.write_str("InitializeOutput"),
        }
    }
}

impl Serialize for StepKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One action in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "Type")]
    pub kind: StepKind,

    #[serde(rename = "Coordinates", default)]
    pub coordinates: Coordinates,

    #[serde(rename = "Text", default, skip_serializing_if = "String::is_empty")]
    pub text: String,

    /// Sleep duration in seconds for `HumanDelay`, or the wait timeout
    /// for `WaitForField`.
    #[serde(rename = "Delay", default, skip_serializing_if = "is_zero")]
    pub delay: f64,
}

impl Step {
    /// Shorthand constructor for steps that carry no payload.
    pub fn bare(kind: StepKind) -> Self {
        Self {
            kind,
            coordinates: Coordinates::default(),
            text: String::new(),
            delay: 0.0,
        }
    }
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

fn default_true() -> bool {
    true
}

fn default_ramp_batch() -> u32 {
    DEFAULT_RAMP_BATCH
}

fn default_ramp_delay() -> f64 {
    DEFAULT_RAMP_DELAY
}

/// A workflow: the host endpoint plus the ordered steps to run against it.
/// Immutable once loaded; the scheduler materializes fresh copies with
/// injection values substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Configuration {
    pub host: String,
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,

    /// Wait for an input field right after `Connect`. Default: true.
    #[serde(default = "default_true")]
    pub wait_for_field: bool,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Pacing delay in seconds slept between steps (not before the first).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub delay: f64,

    /// Value substituted for `{{token}}` placeholders in step text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Recorder script to derive steps from instead of `Steps`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_path: Option<String>,

    /// Workflows released per ramp batch. Default: 10.
    #[serde(default = "default_ramp_batch")]
    pub ramp_up_batch_size: u32,

    /// Delay between ramp batches in seconds. Default: 1.0.
    #[serde(default = "default_ramp_delay")]
    pub ramp_up_delay: f64,
}

impl Configuration {
    /// Load a workflow configuration from a JSON file, normalize defaults,
    /// and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading workflow file {}", path.display()))?;

        let mut cfg: Configuration = serde_json::from_str(&data)
            .with_context(|| format!("parsing workflow file {}", path.display()))?;

        cfg.normalize();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Clamp out-of-range ramp settings back to their defaults.
    pub fn normalize(&mut self) {
        if self.ramp_up_batch_size == 0 {
            self.ramp_up_batch_size = DEFAULT_RAMP_BATCH;
        }
        if self.ramp_up_delay <= 0.0 {
            self.ramp_up_delay = DEFAULT_RAMP_DELAY;
        }
    }

    /// Validate the configuration for required fields and step shapes.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("Host is required");
        }
        if self.port == 0 {
            bail!("Port must be positive");
        }
        if self.delay < 0.0 {
            bail!("Delay must be zero or positive");
        }

        if self.output_file_path.is_none()
            && self
                .steps
                .iter()
                .any(|s| s.kind == StepKind::AsciiScreenGrab)
        {
            bail!("OutputFilePath is required when a step is AsciiScreenGrab");
        }

        for step in &self.steps {
            match step.kind {
                StepKind::HumanDelay => {
                    if step.delay <= 0.0 {
                        bail!("HumanDelay step needs a positive Delay value");
                    }
                }
                StepKind::FillString | StepKind::CheckValue => {
                    let c = step.coordinates;
                    let at_cursor = c.row == 0 && c.column == 0;
                    if at_cursor && step.kind == StepKind::CheckValue {
                        bail!("coordinates missing in CheckValue step");
                    }
                    if !at_cursor && (c.row == 0 || c.column == 0) {
                        bail!("coordinates missing in {} step", step.kind);
                    }
                    if step.text.is_empty() {
                        bail!("text empty in {} step", step.kind);
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// The ramp delay as a duration.
    pub fn ramp_delay(&self) -> Duration {
        Duration::from_secs_f64(self.ramp_up_delay)
    }

    /// The inter-step pacing delay, if any.
    pub fn step_delay(&self) -> Option<Duration> {
        (self.delay > 0.0).then(|| Duration::from_secs_f64(self.delay))
    }

    /// Materialize a concrete configuration from this template by replacing
    /// every injection placeholder occurrence in step text. The template is
    /// left untouched.
    pub fn inject(&self, entry: &InjectionEntry) -> Configuration {
        let mut concrete = self.clone();
        for step in &mut concrete.steps {
            for (placeholder, value) in &entry.values {
                if step.text.contains(placeholder.as_str()) {
                    step.text = step.text.replace(placeholder.as_str(), value);
                }
            }
        }
        concrete
    }
}

/// One injection entry: placeholder text mapped to its replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionEntry {
    pub values: Vec<(String, String)>,
}

/// An ordered table of injection entries cycled by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct InjectionTable {
    entries: Vec<InjectionEntry>,
}

impl InjectionTable {
    /// Load injection data from a JSON file. Accepts an array of objects,
    /// a single object, or an object wrapping an array under `entries` or
    /// `data`. Values are coerced to strings.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading injection file {}", path.display()))?;

        let raw: serde_json::Value = serde_json::from_str(&data)
            .with_context(|| format!("parsing injection file {}", path.display()))?;

        let entries = match raw {
            serde_json::Value::Array(items) => convert_entries(&items)?,
            serde_json::Value::Object(map) => {
                if let Some(wrapped) = map.get("entries").or_else(|| map.get("data")) {
                    let serde_json::Value::Array(items) = wrapped else {
                        bail!("injection 'entries'/'data' must be an array");
                    };
                    convert_entries(items)?
                } else {
                    if map.is_empty() {
                        bail!("injection object is empty");
                    }
                    vec![object_to_entry(&map)]
                }
            }
            _ => bail!("unsupported injection data format"),
        };

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Round-robin iterator over the entries. An empty table yields a
    /// reusable empty entry so the scheduler does not need a special case.
    pub fn cycle(&self) -> InjectionCycle<'_> {
        InjectionCycle {
            table: self,
            cursor: 0,
            empty: InjectionEntry::default(),
        }
    }
}

/// Scheduler-local cursor over an injection table.
pub struct InjectionCycle<'a> {
    table: &'a InjectionTable,
    cursor: usize,
    empty: InjectionEntry,
}

impl InjectionCycle<'_> {
    /// Return the next entry, advancing the cursor modulo the table size.
    pub fn next_entry(&mut self) -> &InjectionEntry {
        if self.table.entries.is_empty() {
            return &self.empty;
        }
        let entry = &self.table.entries[self.cursor];
        self.cursor = (self.cursor + 1) % self.table.entries.len();
        entry
    }
}

fn convert_entries(items: &[serde_json::Value]) -> Result<Vec<InjectionEntry>> {
    let mut entries = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let serde_json::Value::Object(map) = item else {
            bail!("injection entry {idx} must be an object");
        };
        entries.push(object_to_entry(map));
    }
    if entries.is_empty() {
        bail!("injection data contains no entries");
    }
    Ok(entries)
}

fn object_to_entry(map: &serde_json::Map<String, serde_json::Value>) -> InjectionEntry {
    let values = map
        .iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect();
    InjectionEntry { values }
}

/// Derive steps from a recorded terminal script: `sendKeys` lines map to
/// key presses or fills, `wait.forText` lines to value checks. The result
/// is bracketed by Connect/Disconnect steps.
pub fn load_input_steps(path: &Path) -> Result<Vec<Step>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading input script {}", path.display()))?;

    let mut steps = vec![Step::bare(StepKind::Connect)];

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("yield ps.sendKeys(") {
            let key = rest.trim_end_matches(");").trim_matches('\'');
            let kind = control_key_step(key).unwrap_or(StepKind::FillString);
            steps.push(Step {
                kind,
                coordinates: Coordinates::default(),
                text: key.to_string(),
                delay: 0.0,
            });
        } else if let Some(rest) = line.strip_prefix("yield wait.forText(") {
            let Some((text_part, pos_part)) = rest.split_once(',') else {
                continue;
            };
            let text = text_part.trim().trim_matches('\'');
            let Some(pos) = pos_part
                .trim()
                .strip_prefix("new Position(")
                .map(|p| p.trim_end_matches(");").trim_end_matches(')'))
            else {
                continue;
            };
            let Some((row, column)) = pos.split_once(',') else {
                continue;
            };
            let (Ok(row), Ok(column)) = (row.trim().parse::<u32>(), column.trim().parse::<u32>())
            else {
                continue;
            };
            steps.push(Step {
                kind: StepKind::CheckValue,
                coordinates: Coordinates {
                    row,
                    column,
                    length: text.len() as u32,
                },
                text: text.to_string(),
                delay: 0.0,
            });
        }
    }

    steps.push(Step::bare(StepKind::Disconnect));
    Ok(steps)
}

fn control_key_step(key: &str) -> Option<StepKind> {
    match key {
        "ControlKey.TAB" => Some(StepKind::PressTab),
        "ControlKey.ENTER" => Some(StepKind::PressEnter),
        _ => {
            let n = key.strip_prefix("ControlKey.F")?.parse::<u8>().ok()?;
            (1..=24).contains(&n).then_some(StepKind::PressPf(n))
        }
    }
}
