//! Kernel language identifiers, as reported by `kernel_info_reply`.
//!
//! Unknown values are preserved via `Other(String)` so an unsupported kernel
//! still carries its real name into labels and logs.

use schemars::JsonSchema;
use ts_rs::TS;

/// Language a kernel executes, used to pick an inspection script bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, TS)]
#[ts(export)]
#[ts(type = "\"python\" | \"r\" | (string & {})")]
pub enum KernelLanguage {
    Python,
    R,
    /// A language without an inspection bundle, kept verbatim.
    Other(String),
}

// ── Serde ────────────────────────────────────────────────────────────

impl serde::Serialize for KernelLanguage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for KernelLanguage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(KernelLanguage::from_name(&s))
    }
}

// ── JSON Schema ─────────────────────────────────────────────────────

impl JsonSchema for KernelLanguage {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "KernelLanguage".into()
    }

    fn json_schema(_gen: &mut schemars::SchemaGenerator) -> schemars::Schema {
        schemars::json_schema!({
            "type": "string",
            "examples": ["python", "r"]
        })
    }
}

// ── Display / FromStr ───────────────────────────────────────────────

impl KernelLanguage {
    /// Parse a kernel-reported language name. Never fails.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => KernelLanguage::Python,
            "r" | "ir" => KernelLanguage::R,
            _ => KernelLanguage::Other(name.to_string()),
        }
    }

    /// Human-readable label for update event titles.
    pub fn label(&self) -> &str {
        match self {
            KernelLanguage::Python => "Python",
            KernelLanguage::R => "R",
            KernelLanguage::Other(s) => s,
        }
    }
}

impl std::fmt::Display for KernelLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelLanguage::Python => write!(f, "python"),
            KernelLanguage::R => write!(f, "r"),
            KernelLanguage::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for KernelLanguage {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(KernelLanguage::from_name(s))
    }
}
