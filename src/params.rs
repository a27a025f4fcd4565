use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::BufReader,
    path::PathBuf,
};

use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which half of a [`ParameterStore`] a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Learnable weights.
    Argument,
    /// Running statistics such as batch-norm moving mean/variance.
    Auxiliary,
}

/// Named weight and statistic tensors loaded from a checkpoint.
///
/// Names are unique across both halves. Values are plain [`TensorData`], so
/// cloning one is a deep copy of its buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    arg_params: BTreeMap<String, TensorData>,
    aux_params: BTreeMap<String, TensorData>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from separate argument and auxiliary maps.
    ///
    /// Fails if a name is present in both.
    pub fn from_parts(
        arg_params: BTreeMap<String, TensorData>,
        aux_params: BTreeMap<String, TensorData>,
    ) -> Result<Self> {
        if let Some(name) = arg_params.keys().find(|k| aux_params.contains_key(*k)) {
            return Err(Error::Configuration(format!(
                "parameter '{name}' is both an argument and an auxiliary state"
            )));
        }

        Ok(Self {
            arg_params,
            aux_params,
        })
    }

    pub fn get(&self, kind: ParamKind, name: &str) -> Option<&TensorData> {
        self.half(kind).get(name)
    }

    pub fn arg(&self, name: &str) -> Option<&TensorData> {
        self.arg_params.get(name)
    }

    pub fn aux(&self, name: &str) -> Option<&TensorData> {
        self.aux_params.get(name)
    }

    /// Shape of `name` in the given half, if present.
    pub fn shape(&self, kind: ParamKind, name: &str) -> Option<&[usize]> {
        self.get(kind, name).map(|t| t.shape.as_slice())
    }

    /// Inserts or overwrites `name` in the given half, returning the previous
    /// value.
    ///
    /// Fails if `name` already lives in the other half.
    pub fn insert(
        &mut self,
        kind: ParamKind,
        name: String,
        value: TensorData,
    ) -> Result<Option<TensorData>> {
        let other = match kind {
            ParamKind::Argument => ParamKind::Auxiliary,
            ParamKind::Auxiliary => ParamKind::Argument,
        };
        if self.half(other).contains_key(&name) {
            return Err(Error::Configuration(format!(
                "parameter '{name}' is already an {}",
                match other {
                    ParamKind::Argument => "argument",
                    ParamKind::Auxiliary => "auxiliary state",
                }
            )));
        }

        Ok(self.half_mut(kind).insert(name, value))
    }

    pub fn get_mut(&mut self, kind: ParamKind, name: &str) -> Option<&mut TensorData> {
        self.half_mut(kind).get_mut(name)
    }

    pub fn arg_params(&self) -> &BTreeMap<String, TensorData> {
        &self.arg_params
    }

    pub fn aux_params(&self) -> &BTreeMap<String, TensorData> {
        &self.aux_params
    }

    pub fn len(&self) -> usize {
        self.arg_params.len() + self.aux_params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> (BTreeMap<String, TensorData>, BTreeMap<String, TensorData>) {
        (self.arg_params, self.aux_params)
    }

    fn half(&self, kind: ParamKind) -> &BTreeMap<String, TensorData> {
        match kind {
            ParamKind::Argument => &self.arg_params,
            ParamKind::Auxiliary => &self.aux_params,
        }
    }

    fn half_mut(&mut self, kind: ParamKind) -> &mut BTreeMap<String, TensorData> {
        match kind {
            ParamKind::Argument => &mut self.arg_params,
            ParamKind::Auxiliary => &mut self.aux_params,
        }
    }
}

/// Loads the parameters of a trained model.
pub trait CheckpointLoader {
    /// Loads the checkpoint saved under `prefix` at `epoch`.
    fn load(&self, prefix: &str, epoch: usize) -> Result<ParameterStore>;
}

/// One tensor as stored in a JSON checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Reads `"{prefix}-{epoch:04}.params.json"`, a map from `"arg:<name>"` or
/// `"aux:<name>"` to a [`StoredTensor`].
#[derive(Debug, Clone)]
pub struct JsonCheckpointLoader {
    /// Rename `*_test*` parameters to their training names.
    pub process: bool,
}

impl Default for JsonCheckpointLoader {
    fn default() -> Self {
        Self { process: true }
    }
}

impl JsonCheckpointLoader {
    pub fn path(prefix: &str, epoch: usize) -> PathBuf {
        format!("{prefix}-{epoch:04}.params.json").into()
    }

    /// Splits the raw key/value map into a [`ParameterStore`].
    ///
    /// With `process` set, a `*_test*` parameter replaces the training
    /// parameter it renames to.
    pub fn to_store(&self, raw: BTreeMap<String, StoredTensor>) -> Result<ParameterStore> {
        let mut plain = Vec::new();
        let mut renamed = Vec::new();

        for (key, stored) in raw {
            let (kind, name) = key
                .split_once(':')
                .ok_or_else(|| Error::Checkpoint(format!("key '{key}' has no arg:/aux: prefix")))?;

            let kind = match kind {
                "arg" => ParamKind::Argument,
                "aux" => ParamKind::Auxiliary,
                other => {
                    return Err(Error::Checkpoint(format!(
                        "unknown parameter kind '{other}' for '{name}'"
                    )));
                }
            };

            let expected: usize = stored.shape.iter().product();
            if expected != stored.data.len() {
                return Err(Error::Checkpoint(format!(
                    "{name}: shape {:?} needs {expected} values, found {}",
                    stored.shape,
                    stored.data.len()
                )));
            }
            let value = TensorData::new(stored.data, stored.shape);

            if self.process && name.contains("_test") {
                renamed.push((kind, name.replace("_test", ""), value));
            } else {
                plain.push((kind, name.to_string(), value));
            }
        }

        let mut store = ParameterStore::new();
        for (kind, name, value) in plain {
            if store.insert(kind, name.clone(), value)?.is_some() {
                return Err(Error::Checkpoint(format!("duplicate parameter '{name}'")));
            }
        }

        let mut replaced = BTreeSet::new();
        for (kind, name, value) in renamed {
            if !replaced.insert(name.clone()) {
                return Err(Error::Checkpoint(format!(
                    "several test parameters rename to '{name}'"
                )));
            }
            if store.insert(kind, name.clone(), value)?.is_some() {
                tracing::debug!("{name} replaced by its test parameter");
            }
        }

        Ok(store)
    }
}

impl CheckpointLoader for JsonCheckpointLoader {
    fn load(&self, prefix: &str, epoch: usize) -> Result<ParameterStore> {
        let path = Self::path(prefix, epoch);
        let file = File::open(&path).map_err(|e| {
            Error::Checkpoint(format!("cannot open checkpoint {}: {e}", path.display()))
        })?;

        let raw: BTreeMap<String, StoredTensor> = serde_json::from_reader(BufReader::new(file))?;
        let store = self.to_store(raw)?;

        tracing::info!(
            "loaded checkpoint {} ({} arguments, {} auxiliary states)",
            path.display(),
            store.arg_params().len(),
            store.aux_params().len()
        );

        Ok(store)
    }
}
