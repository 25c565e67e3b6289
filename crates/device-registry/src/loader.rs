use crate::types::DeviceDescriptor;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

pub fn load_descriptor_file(path: impl AsRef<Path>) -> anyhow::Result<DeviceDescriptor> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading descriptor: {}", path.display()))?;
    let desc: DeviceDescriptor =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    if let Some(sigs) = &desc.catalog {
        crate::CommandCatalog::from_signatures(sigs)
            .with_context(|| format!("fixed catalog in {}", path.display()))?;
    }
    Ok(desc)
}

/// Every `*.yml`/`*.yaml` descriptor in `dir`, in file-name order.
pub fn load_descriptors_dir(dir: impl AsRef<Path>) -> anyhow::Result<Vec<DeviceDescriptor>> {
    let dir = dir.as_ref();
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if let Some(ext) = path.extension() {
            if ext == "yml" || ext == "yaml" {
                entries.push(path);
            }
        }
    }
    entries.sort();
    let mut out = Vec::with_capacity(entries.len());
    for p in entries {
        let desc = load_descriptor_file(&p)?;
        if out.iter().any(|d: &DeviceDescriptor| d.port == desc.port) {
            anyhow::bail!("duplicate port {} in {}", desc.port, p.display());
        }
        out.push(desc);
    }
    Ok(out)
}
