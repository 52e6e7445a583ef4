use std::{path::PathBuf, time::Instant};

use crate::{
    config::{ConvertOptions, ModelFormat},
    custom::CustomObjects,
    fusion::{FusionEngine, Outcome},
    ir::{IrDocument, IrRecord},
    loader::{GraphLoader, OnnxLoader},
    node::GraphNode,
    normalize::normalize,
    registry::LayerSupportRegistry,
    resolve::IndexResolver,
    shape::ShapeOracle,
    translate::{reclassify, IngestContext, Layer, LayerKind},
    writer::IrWriter,
    ConvertError,
};

/// Everything a single conversion run consults besides the graph itself.
pub struct ConvertContext {
    pub format: ModelFormat,
    pub registry: LayerSupportRegistry,
    pub custom: CustomObjects,
}

impl ConvertContext {
    pub fn new(format: ModelFormat) -> Self {
        Self {
            format,
            registry: LayerSupportRegistry::builtin(),
            custom: CustomObjects::new(),
        }
    }

    pub fn with_registry(mut self, registry: LayerSupportRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_custom_objects(mut self, custom: CustomObjects) -> Self {
        self.custom = custom;
        self
    }
}

/// Turns a raw node list into a resolved IR document.
pub fn convert_graph(
    cx: &ConvertContext,
    nodes: Vec<GraphNode>,
    shapes: &dyn ShapeOracle,
) -> Result<IrDocument, ConvertError> {
    let mut graph = normalize(nodes, cx.format)?;
    reclassify(&mut graph, cx.format);

    let start = Instant::now();
    let engine = FusionEngine::new(&cx.registry, cx.format);
    let icx = IngestContext {
        format: cx.format,
        shapes,
        custom: &cx.custom,
    };

    let mut layers: Vec<(_, Box<dyn Layer>)> = Vec::new();
    let mut fused = 0;
    for id in graph.live_ids() {
        if graph.nodes[id].deleted {
            continue;
        }
        let kind = LayerKind::resolve(cx.format, &graph.nodes[id].op_type, &cx.custom)?;
        match engine.fuse_node(&mut graph, id, &kind)? {
            Outcome::Kept => {
                let mut layer = kind.build()?;
                layer.ingest(&graph.nodes[id], &icx)?;
                layers.push((id, layer));
            }
            Outcome::Fused { .. } | Outcome::Elided => fused += 1,
        }
    }
    log::info!(
        "translate({}, fused {fused}): {:?}",
        layers.len(),
        start.elapsed()
    );

    let mut records: Vec<IrRecord> = layers
        .iter()
        .filter(|(id, _)| !graph.nodes[*id].deleted)
        .map(|(id, layer)| layer.emit(&graph.nodes[*id]))
        .collect();
    IndexResolver::resolve(&mut records)?;

    Ok(IrDocument {
        records,
        bin_file_name: None,
    })
}

/// One conversion from a model file to IR files on disk.
pub struct Converter {
    options: ConvertOptions,
    registry: Option<LayerSupportRegistry>,
    custom: Option<CustomObjects>,
    loader: Option<Box<dyn GraphLoader>>,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self {
            options,
            registry: None,
            custom: None,
            loader: None,
        }
    }

    /// Replaces the built-in fusion tables.
    pub fn with_registry(mut self, registry: LayerSupportRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Custom objects to use when the options name no definition file.
    pub fn with_custom_objects(mut self, custom: CustomObjects) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Loader for the model. Required for Keras models.
    pub fn with_loader(mut self, loader: Box<dyn GraphLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Validates the options, converts and writes the output. Returns the written paths.
    pub fn convert(&mut self) -> Result<Vec<PathBuf>, ConvertError> {
        let checked = self.options.check()?;
        log::debug!(
            "converting {} as {:?} for {:?}",
            self.options.model_path.display(),
            checked.format,
            checked.framework
        );

        let custom = match &self.options.custom_layers_file {
            Some(path) => CustomObjects::from_file(path).map_err(|e| match e {
                ConvertError::Json(_) => ConvertError::InvalidCustomLayerFile(path.clone()),
                e => e,
            })?,
            None => self.custom.take().unwrap_or_default(),
        };

        let mut loader: Box<dyn GraphLoader> = match self.loader.take() {
            Some(loader) if loader.format() == checked.format => loader,
            Some(_) => {
                return Err(ConvertError::InvalidModelFormat(
                    self.options.model_path.clone(),
                ))
            }
            None => match checked.format {
                ModelFormat::Onnx => Box::new(OnnxLoader::from_path(&self.options.model_path)?),
                ModelFormat::Keras => return Err(ConvertError::NoLoader(checked.format)),
            },
        };

        let start = Instant::now();
        let loaded = loader.load()?;
        log::info!(
            "load({}, shapes {}): {:?}",
            loaded.nodes.len(),
            loaded.shapes.len(),
            start.elapsed()
        );

        let cx = ConvertContext {
            format: checked.format,
            registry: self
                .registry
                .take()
                .unwrap_or_else(LayerSupportRegistry::builtin),
            custom,
        };
        let doc = convert_graph(&cx, loaded.nodes, &loaded.shapes)?;
        IrWriter::new(&self.options).write(doc)
    }
}
