use std::{fs, path::Path};

use anyhow::{Context, Error};
use schemars::schema_for;
use tracing::info;

use crate::config::BridgeConfig;
use crate::message::{InboundMessage, OutboundMessage};

/// Writes JSON Schemas for the wire messages and the bridge configuration
/// into `out_dir`, returning the file names written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir).with_context(|| format!("could not create {}", out_dir.display()))?;

    let schemas = [
        ("layout-request.schema.json", schema_for!(InboundMessage)),
        ("layout-reply.schema.json", schema_for!(OutboundMessage)),
        ("bridge-config.schema.json", schema_for!(BridgeConfig)),
    ];

    let mut written = Vec::new();
    for (name, schema) in schemas {
        let json = serde_json::to_string_pretty(&schema)?;
        fs::write(out_dir.join(name), json).with_context(|| format!("could not write {name}"))?;
        info!(file = name, "schema written");
        written.push(name.to_string());
    }
    Ok(written)
}
