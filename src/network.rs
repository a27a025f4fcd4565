use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::Variant,
    error::{Error, Result},
};

/// Substring marking an argument as a training label.
pub const LABEL_MARKER: &str = "label";

/// A named tensor-shape requirement such as `("data", [1, 3, H, W])`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ShapeSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }
}

/// Shapes produced by shape inference, keyed by name.
///
/// Labels are absent at test time so inference may leave them out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferredShapes {
    pub arguments: BTreeMap<String, Vec<usize>>,
    pub auxiliary_states: BTreeMap<String, Vec<usize>>,
}

/// The symbolic network the checkpoint is bound to.
///
/// Only read from: this crate never alters a declaration.
pub trait NetworkDeclaration {
    /// Builder entry point this declaration was produced by.
    fn entry_point(&self) -> &str;

    fn list_arguments(&self) -> Vec<String>;

    fn list_auxiliary_states(&self) -> Vec<String>;

    /// Infers every argument and auxiliary shape from the bound input shapes.
    fn infer_shape(&self, inputs: &[ShapeSpec]) -> Result<InferredShapes>;
}

/// How an argument of a manifest gets its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgumentRole {
    /// A weight with a fixed shape.
    Weight { shape: Vec<usize> },
    /// A data placeholder of the given rank, shaped by the bound inputs.
    Input { rank: usize },
    /// A training label, unused when testing.
    Label,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestArgument {
    pub name: String,
    pub role: ArgumentRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAuxiliary {
    pub name: String,
    pub shape: Vec<usize>,
}

/// A [`NetworkDeclaration`] read from a JSON manifest exported alongside the
/// network graph.
///
/// ```json
/// {
///   "entry_point": "resnet_fpn_test",
///   "arguments": [
///     { "name": "data", "role": { "kind": "input", "rank": 4 } },
///     { "name": "conv0_weight", "role": { "kind": "weight", "shape": [64, 3, 7, 7] } },
///     { "name": "label", "role": { "kind": "label" } }
///   ],
///   "auxiliary_states": [{ "name": "bn0_moving_mean", "shape": [64] }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDeclaration {
    pub entry_point: String,
    pub arguments: Vec<ManifestArgument>,
    #[serde(default)]
    pub auxiliary_states: Vec<ManifestAuxiliary>,
}

impl ManifestDeclaration {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Configuration(format!("cannot open network manifest {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

impl NetworkDeclaration for ManifestDeclaration {
    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn list_arguments(&self) -> Vec<String> {
        self.arguments.iter().map(|a| a.name.clone()).collect()
    }

    fn list_auxiliary_states(&self) -> Vec<String> {
        self.auxiliary_states.iter().map(|a| a.name.clone()).collect()
    }

    fn infer_shape(&self, inputs: &[ShapeSpec]) -> Result<InferredShapes> {
        let mut inferred = InferredShapes::default();

        for arg in self.arguments.iter() {
            match &arg.role {
                ArgumentRole::Weight { shape } => {
                    inferred.arguments.insert(arg.name.clone(), shape.clone());
                }
                ArgumentRole::Input { rank } => {
                    let bound = inputs.iter().find(|s| s.name == arg.name).ok_or_else(|| {
                        Error::Configuration(format!("input '{}' has no bound shape", arg.name))
                    })?;
                    if bound.shape.len() != *rank {
                        return Err(Error::Configuration(format!(
                            "input '{}' expects rank {rank}, bound shape is {:?}",
                            arg.name, bound.shape
                        )));
                    }
                    inferred.arguments.insert(arg.name.clone(), bound.shape.clone());
                }
                ArgumentRole::Label => {}
            }
        }

        for aux in self.auxiliary_states.iter() {
            inferred
                .auxiliary_states
                .insert(aux.name.clone(), aux.shape.clone());
        }

        Ok(inferred)
    }
}

/// Which network builder a test run uses.
///
/// Resolved once from the network name, the proposal mode and the variant,
/// so the rest of the run never branches on the individual flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBuilder {
    pub network: String,
    pub has_rpn: bool,
    pub variant: Variant,
}

impl NetworkBuilder {
    pub fn new(network: &str, has_rpn: bool, variant: Variant) -> Result<Self> {
        if network.is_empty()
            || !network
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Configuration(format!(
                "invalid network name '{network}'"
            )));
        }

        Ok(Self {
            network: network.to_string(),
            has_rpn,
            variant,
        })
    }

    /// `"{network}_test"` when proposals are generated internally, otherwise
    /// `"{network}_rcnn_test"`, followed by the variant suffix.
    pub fn entry_point(&self) -> String {
        let stage = if self.has_rpn { "test" } else { "rcnn_test" };
        format!("{}_{}{}", self.network, stage, self.variant.suffix())
    }

    pub fn manifest_path(&self, symbol_dir: &Path) -> PathBuf {
        symbol_dir.join(format!("{}.json", self.entry_point()))
    }

    /// Loads the declaration for this builder from `symbol_dir`.
    pub fn load(&self, symbol_dir: &Path) -> Result<ManifestDeclaration> {
        let manifest = ManifestDeclaration::from_file(&self.manifest_path(symbol_dir))?;
        if manifest.entry_point != self.entry_point() {
            return Err(Error::Configuration(format!(
                "manifest declares entry point '{}', expected '{}'",
                manifest.entry_point,
                self.entry_point()
            )));
        }
        Ok(manifest)
    }
}
