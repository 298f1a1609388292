//! Built-in `manifest` plugin
//!
//! Collects the files `SaveFiles` reports as written and, when the stage
//! ends, writes them as a JSON manifest next to the KML output
//! (`out.kml` → `out.manifest.json`).

use std::any::Any;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use photoplace_common::events::{default_event_name, CallArgs, Phase, DEFAULT_SEPARATOR};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{Capabilities, HostWidget, Plugin, PluginContext, PluginInfo, PluginModule, Registrar};

pub const MODULE_NAME: &str = "manifest";

const STAGE: &str = "SaveFiles";

#[derive(Debug, Default)]
pub struct Manifest {
    output: Option<PathBuf>,
    files: Vec<PathBuf>,
    written: Option<PathBuf>,
}

#[derive(Serialize)]
struct ManifestFile<'a> {
    kml: &'a PathBuf,
    files: &'a [PathBuf],
    reported: Option<&'a Value>,
    generated_at: String,
}

impl Manifest {
    /// Path of the last manifest written
    pub fn written(&self) -> Option<&PathBuf> {
        self.written.as_ref()
    }

    fn on_ini(&mut self, args: &CallArgs) -> anyhow::Result<()> {
        let output = args
            .get(0)
            .and_then(Value::as_str)
            .context("output path missing from ini arguments")?;
        self.output = Some(PathBuf::from(output));
        self.files.clear();
        Ok(())
    }

    fn on_run(&mut self, args: &CallArgs) -> anyhow::Result<()> {
        if args.get(1).and_then(Value::as_i64) == Some(1) {
            if let Some(path) = args.get(0).and_then(Value::as_str) {
                self.files.push(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn on_end(&mut self, args: &CallArgs) -> anyhow::Result<()> {
        let output = self
            .output
            .as_ref()
            .context("no output file was announced before end")?;
        let path = output.with_extension("manifest.json");
        let manifest = ManifestFile {
            kml: output,
            files: &self.files,
            reported: args.get(0),
            generated_at: Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&path, content)
            .with_context(|| format!("cannot write manifest {}", path.display()))?;

        info!("Manifest with {} file(s) written to {:?}", self.files.len(), path);
        self.written = Some(path);
        Ok(())
    }
}

impl Plugin for Manifest {
    fn init(&mut self, _options: &Value, _host: Option<&HostWidget>) -> anyhow::Result<()> {
        self.reset()
    }

    fn end(&mut self, _options: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.output = None;
        self.files.clear();
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn register(registrar: &mut Registrar<'_>) {
    registrar
        .on::<Manifest>(&default_event_name(STAGE, Phase::Ini, DEFAULT_SEPARATOR), Manifest::on_ini)
        .on::<Manifest>(&default_event_name(STAGE, Phase::Run, DEFAULT_SEPARATOR), Manifest::on_run)
        .on::<Manifest>(&default_event_name(STAGE, Phase::End, DEFAULT_SEPARATOR), Manifest::on_end);
}

fn build(_ctx: &PluginContext) -> anyhow::Result<Box<dyn Plugin>> {
    Ok(Box::new(Manifest::default()))
}

/// Module descriptor of the manifest plugin
pub fn module() -> PluginModule {
    PluginModule {
        info: PluginInfo {
            name: MODULE_NAME.to_string(),
            description: "Writes a JSON manifest of the files produced by SaveFiles".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: "PhotoPlace".to_string(),
            capabilities: Capabilities::default(),
        },
        register,
        factory: build,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writes_manifest_of_reported_files() {
        let dir = TempDir::new().unwrap();
        let kml = dir.path().join("out.kml");
        let kml_str = kml.to_string_lossy().to_string();

        let mut manifest = Manifest::default();
        manifest.on_ini(&CallArgs::new().arg(kml_str.clone())).unwrap();
        manifest.on_run(&CallArgs::new().arg("/photos/a.jpg").arg(0)).unwrap();
        manifest.on_run(&CallArgs::new().arg("/out/a.jpg").arg(1)).unwrap();
        manifest.on_run(&CallArgs::new().arg(kml_str).arg(1)).unwrap();
        manifest.on_end(&CallArgs::new().arg(2)).unwrap();

        let written = manifest.written().unwrap().clone();
        assert_eq!(written, dir.path().join("out.manifest.json"));
        let content: Value = serde_json::from_str(&std::fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(content["files"].as_array().unwrap().len(), 2);
        assert_eq!(content["reported"], serde_json::json!(2));
    }

    #[test]
    fn test_end_without_ini_fails() {
        let mut manifest = Manifest::default();
        assert!(manifest.on_end(&CallArgs::new()).is_err());
    }
}
