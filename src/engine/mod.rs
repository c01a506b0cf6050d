//! Layout engines turn a textual graph description into diagram markup.
//!
//! Two implementations ship with the crate: [`wasm::WasmLayoutEngine`], which
//! drives a compiled guest module through wasmtime, and
//! [`native::NativeLayoutEngine`], used when no engine asset is configured.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub mod dot;
pub mod layered;
pub mod native;
pub mod svg;
pub mod wasm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Svg,
}

/// Directives handed to the engine alongside the graph text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LayoutOptions {
    /// Layout algorithm name, e.g. `dot`.
    pub engine: String,
    pub format: OutputFormat,
    pub input: InputFormat,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            engine: "dot".to_string(),
            format: OutputFormat::Svg,
            input: InputFormat::Dot,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LayoutError {
    #[error("syntax error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("layout engine failed: {0}")]
    Engine(String),
    #[error("layout engine returned invalid output: {0}")]
    InvalidOutput(String),
    #[error("unsupported layout option: {0}")]
    Unsupported(String),
}

/// Something that can lay out a graph. Implementations are shared across
/// jobs and threads, and `render` is called from a blocking worker thread.
pub trait LayoutEngine: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn render(&self, graph: &str, options: &LayoutOptions) -> Result<String, LayoutError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_default_options_serialise_like_the_guest_expects() {
        let json = serde_json::to_value(LayoutOptions::default()).unwrap();
        assert_eq!(json, serde_json::json!({"engine": "dot", "format": "svg", "input": "dot"}));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(OutputFormat::from_str("SVG").unwrap(), OutputFormat::Svg);
        assert!(OutputFormat::from_str("png").is_err());
        assert_eq!(InputFormat::from_str("dot").unwrap(), InputFormat::Dot);
    }
}
