use std::{fs, path::PathBuf, time::Instant};

use crate::{config::ConvertOptions, ir::IrDocument, weights::encode_weights, ConvertError};

/// Writes the IR document and, when weights are decoupled, the binary weight file.
pub struct IrWriter<'a> {
    options: &'a ConvertOptions,
}

impl<'a> IrWriter<'a> {
    pub fn new(options: &'a ConvertOptions) -> Self {
        Self { options }
    }

    /// Both artifacts are encoded before anything touches the disk, and a weight file is removed
    /// again if the JSON cannot be written. Returns the written paths, JSON first.
    pub fn write(&self, mut doc: IrDocument) -> Result<Vec<PathBuf>, ConvertError> {
        let start = Instant::now();
        let dir = self.options.output_dir();

        doc.bin_file_name = self.options.bin_file_name();
        let weights = doc.bin_file_name.as_ref().map(|_| encode_weights(&doc.records));
        let json = doc.to_json_string()?;

        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(&dir)?;
        }
        let json_path = dir.join(self.options.json_file_name());
        let mut written = vec![json_path.clone()];
        if let (Some(name), Some(bytes)) = (&doc.bin_file_name, weights) {
            let bin_path = dir.join(name);
            fs::write(&bin_path, &bytes)?;
            log::debug!("wrote {} bytes of weights to {}", bytes.len(), bin_path.display());
            written.push(bin_path);
        }
        if let Err(e) = fs::write(&json_path, json) {
            for path in &written[1..] {
                if let Err(e) = fs::remove_file(path) {
                    log::warn!("failed to remove {}: {e}", path.display());
                }
            }
            return Err(e.into());
        }

        log::info!("write_ir({}): {:?}", doc.records.len(), start.elapsed());
        Ok(written)
    }
}

#[test]
fn decoupled_names() {
    use crate::ir::{IrRecord, KernelWeights};

    let dir = tempfile::tempdir().unwrap();
    let options = ConvertOptions::new(dir.path().join("net.onnx"))
        .with_decoupled_weights(true)
        .with_output_dir(dir.path().join("out"));
    let mut record = IrRecord::new("fc", "Gemm");
    record.weights = Some(KernelWeights {
        kernel: vec![1.0, 2.0],
        bias: Some(vec![3.0]),
    });
    let doc = IrDocument {
        records: vec![record],
        bin_file_name: None,
    };

    let written = IrWriter::new(&options).write(doc).unwrap();
    assert_eq!(written[0], dir.path().join("out/net_layers.json"));
    assert_eq!(written[1], dir.path().join("out/net_weights.bin"));
    assert_eq!(fs::read(&written[1]).unwrap().len(), 12);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
    assert_eq!(json["numLayers"]["bin_file_name"], "net_weights.bin");
    assert!(json["Layer_0"].get("weights").is_none());
}

#[test]
fn failed_json_write_leaves_no_weights() {
    use crate::ir::{IrRecord, KernelWeights};

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    // A directory where the JSON file should go makes the write fail.
    fs::create_dir_all(out.join("net_layers.json")).unwrap();
    let options = ConvertOptions::new(dir.path().join("net.onnx"))
        .with_decoupled_weights(true)
        .with_output_dir(out.clone());
    let mut record = IrRecord::new("fc", "Gemm");
    record.weights = Some(KernelWeights {
        kernel: vec![1.0],
        bias: None,
    });
    let doc = IrDocument {
        records: vec![record],
        bin_file_name: None,
    };

    assert!(IrWriter::new(&options).write(doc).is_err());
    assert!(!out.join("net_weights.bin").exists());
}
