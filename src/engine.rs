use std::{collections::BTreeMap, sync::Arc};

use burn::tensor::{Tensor, TensorData, backend::Backend};

use crate::{
    error::{Error, Result},
    loader::TestBatch,
    network::ShapeSpec,
    params::ParameterStore,
    postprocess::Detection,
    session::{SessionRequest, check_envelope},
};

/// Per-ROI class scores and class-specific boxes of one batch.
///
/// Boxes are `x1, y1, x2, y2` in input (resized) pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetections {
    num_classes: usize,
    /// `[roi][class]`
    scores: Vec<f32>,
    /// `[roi][class]`
    boxes: Vec<[f32; 4]>,
}

impl RawDetections {
    pub fn new(num_classes: usize, scores: Vec<f32>, boxes: Vec<[f32; 4]>) -> Result<Self> {
        if num_classes == 0 || scores.len() != boxes.len() || scores.len() % num_classes != 0 {
            return Err(Error::EvaluationFailure(format!(
                "{} scores and {} boxes do not split into {num_classes} classes",
                scores.len(),
                boxes.len()
            )));
        }

        Ok(Self {
            num_classes,
            scores,
            boxes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_rois(&self) -> usize {
        self.scores.len() / self.num_classes
    }

    /// Every ROI's detection for `class`, mapped back to original image
    /// pixels by dividing by `im_scale`.
    pub fn candidates(&self, class: usize, im_scale: f32) -> Vec<Detection> {
        (0..self.num_rois())
            .map(|roi| {
                let i = roi * self.num_classes + class;
                Detection {
                    bbox: self.boxes[i].map(|v| v / im_scale),
                    score: self.scores[i],
                }
            })
            .collect()
    }
}

/// A network bound to its parameters, ready to run test batches.
pub trait Predictor {
    fn predict(&mut self, batch: &TestBatch) -> Result<RawDetections>;
}

/// Binds a network and its parameters into a [`Predictor`].
pub trait ExecutionEngine {
    type Predictor: Predictor;

    fn bind(&self, request: SessionRequest<'_>) -> Result<Self::Predictor>;
}

/// A flat device tensor with the shape it was stored with.
#[derive(Debug, Clone)]
pub struct DeviceTensor<B: Backend> {
    pub value: Tensor<B, 1>,
    pub shape: Vec<usize>,
}

impl<B: Backend> DeviceTensor<B> {
    pub fn upload(name: &str, data: &TensorData, device: &B::Device) -> Result<Self> {
        let values = data
            .to_vec::<f32>()
            .map_err(|e| Error::BindFailure(format!("{name}: {e:?}")))?;
        let len = values.len();

        Ok(Self {
            value: Tensor::from_data(TensorData::new(values, [len]), device),
            shape: data.shape.clone(),
        })
    }

    /// The tensor in its stored shape.
    pub fn reshaped<const D: usize>(&self) -> Result<Tensor<B, D>> {
        let dims: [usize; D] = self.shape.clone().try_into().map_err(|shape| {
            Error::EvaluationFailure(format!("tensor of shape {shape:?} is not rank {D}"))
        })?;
        Ok(self.value.clone().reshape(dims))
    }
}

/// Named device tensors.
#[derive(Debug, Clone)]
pub struct DeviceTensors<B: Backend> {
    tensors: BTreeMap<String, DeviceTensor<B>>,
}

impl<B: Backend> DeviceTensors<B> {
    pub fn upload<'a>(
        named: impl IntoIterator<Item = (&'a String, &'a TensorData)>,
        device: &B::Device,
    ) -> Result<Self> {
        let tensors = named
            .into_iter()
            .map(|(name, data)| Ok((name.clone(), DeviceTensor::upload(name, data, device)?)))
            .collect::<Result<_>>()?;

        Ok(Self { tensors })
    }

    pub fn get(&self, name: &str) -> Result<&DeviceTensor<B>> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::EvaluationFailure(format!("no tensor named {name}")))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Forward computation of a detection network.
pub trait DetectionGraph<B: Backend>: Send + Sync {
    fn forward(&self, params: &DeviceTensors<B>, inputs: &DeviceTensors<B>) -> Result<RawDetections>;
}

/// Detection graphs by builder entry point.
pub struct GraphRegistry<B: Backend> {
    graphs: BTreeMap<String, Arc<dyn DetectionGraph<B>>>,
}

impl<B: Backend> Default for GraphRegistry<B> {
    fn default() -> Self {
        Self {
            graphs: BTreeMap::new(),
        }
    }
}

impl<B: Backend> GraphRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry_point: &str, graph: Arc<dyn DetectionGraph<B>>) {
        self.graphs.insert(entry_point.to_string(), graph);
    }

    pub fn get(&self, entry_point: &str) -> Option<Arc<dyn DetectionGraph<B>>> {
        self.graphs.get(entry_point).cloned()
    }

    pub fn entry_points(&self) -> Vec<&str> {
        self.graphs.keys().map(String::as_str).collect()
    }
}

/// Runs registered [`DetectionGraph`]s on a burn backend.
pub struct BurnEngine<B: Backend> {
    device: B::Device,
    registry: GraphRegistry<B>,
}

impl<B: Backend> BurnEngine<B> {
    pub fn new(device: B::Device, registry: GraphRegistry<B>) -> Self {
        Self { device, registry }
    }
}

impl<B: Backend> ExecutionEngine for BurnEngine<B> {
    type Predictor = BurnPredictor<B>;

    fn bind(&self, request: SessionRequest<'_>) -> Result<BurnPredictor<B>> {
        let entry_point = request.network.entry_point();
        let graph = self.registry.get(entry_point).ok_or_else(|| {
            Error::BindFailure(format!(
                "no detection graph registered for '{entry_point}' (registered: {:?})",
                self.registry.entry_points()
            ))
        })?;

        let params = upload_store(&request.store, &self.device)?;
        tracing::info!(
            "bound {} on {:?} with {} parameters",
            entry_point,
            self.device,
            params.len()
        );

        Ok(BurnPredictor {
            graph,
            params,
            device: self.device.clone(),
            envelope: request.max_shapes,
        })
    }
}

fn upload_store<B: Backend>(store: &ParameterStore, device: &B::Device) -> Result<DeviceTensors<B>> {
    DeviceTensors::upload(store.arg_params().iter().chain(store.aux_params()), device)
}

/// Parameters stay on the device for the life of the predictor; only the
/// batch inputs are uploaded per call.
pub struct BurnPredictor<B: Backend> {
    graph: Arc<dyn DetectionGraph<B>>,
    params: DeviceTensors<B>,
    device: B::Device,
    envelope: Vec<ShapeSpec>,
}

impl<B: Backend> BurnPredictor<B> {
    pub fn envelope(&self) -> &[ShapeSpec] {
        &self.envelope
    }
}

impl<B: Backend> Predictor for BurnPredictor<B> {
    fn predict(&mut self, batch: &TestBatch) -> Result<RawDetections> {
        check_envelope(&batch.provide_data(), &self.envelope)?;

        let inputs = DeviceTensors::upload(batch.inputs.iter().map(|(n, t)| (n, t)), &self.device)?;
        self.graph.forward(&self.params, &inputs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{adapt::tests::NamesOnly, network::NetworkDeclaration};
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    /// One ROI per batch covering the whole input, scored by the `cls_bias`
    /// parameter.
    pub struct WholeImageGraph;

    impl<Bk: Backend> DetectionGraph<Bk> for WholeImageGraph {
        fn forward(
            &self,
            params: &DeviceTensors<Bk>,
            inputs: &DeviceTensors<Bk>,
        ) -> Result<RawDetections> {
            let bias = params.get("cls_bias")?.reshaped::<1>()?;
            let scores = bias.into_data().to_vec::<f32>().unwrap_or_default();

            let data = inputs.get("data")?.reshaped::<4>()?;
            let [_, _, h, w] = data.dims();
            let whole = [0.0, 0.0, w as f32 - 1.0, h as f32 - 1.0];

            RawDetections::new(scores.len(), scores.clone(), vec![whole; scores.len()])
        }
    }

    fn batch(h: usize, w: usize) -> TestBatch {
        TestBatch {
            image_index: 0,
            scale_index: 0,
            im_scale: 2.0,
            inputs: vec![(
                "data".to_string(),
                TensorData::new(vec![0.0f32; 3 * h * w], [1, 3, h, w]),
            )],
        }
    }

    fn store() -> ParameterStore {
        let mut s = ParameterStore::new();
        s.insert(
            crate::params::ParamKind::Argument,
            "cls_bias".into(),
            TensorData::new(vec![0.1f32, 0.9], [2]),
        ).unwrap();
        s
    }

    fn request<'a>(network: &'a dyn NetworkDeclaration) -> SessionRequest<'a> {
        SessionRequest {
            network,
            store: store(),
            data_names: vec!["data".into()],
            label_names: vec![],
            max_shapes: vec![ShapeSpec::new("data", [1, 3, 8, 8])],
            provide_data: vec![ShapeSpec::new("data", [1, 3, 8, 6])],
            provide_label: vec![],
        }
    }

    fn engine() -> BurnEngine<B> {
        let mut registry = GraphRegistry::new();
        registry.register("tiny_test", Arc::new(WholeImageGraph));
        BurnEngine::new(NdArrayDevice::default(), registry)
    }

    #[test]
    fn test_raw_detections_map_back_to_image() {
        let raw = RawDetections::new(2, vec![0.2, 0.8], vec![[0.0; 4], [2.0, 4.0, 6.0, 8.0]]).unwrap();

        assert_eq!(raw.num_rois(), 1);
        assert_eq!(
            raw.candidates(1, 2.0),
            vec![Detection {
                bbox: [1.0, 2.0, 3.0, 4.0],
                score: 0.8
            }]
        );
    }

    #[test]
    fn test_raw_detections_reject_ragged_output() {
        assert!(RawDetections::new(2, vec![0.1; 3], vec![[0.0; 4]; 3]).is_err());
        assert!(RawDetections::new(2, vec![0.1; 2], vec![[0.0; 4]; 4]).is_err());
    }

    #[test]
    fn test_device_tensor_keeps_its_shape() {
        let device = NdArrayDevice::default();
        let data = TensorData::new((0..6).map(|v| v as f32).collect::<Vec<_>>(), [2, 3]);

        let t = DeviceTensor::<B>::upload("w", &data, &device).unwrap();
        assert_eq!(t.reshaped::<2>().unwrap().dims(), [2, 3]);
        assert!(t.reshaped::<3>().is_err());
    }

    #[test]
    fn test_bind_and_predict_within_envelope() {
        let network = NamesOnly {
            entry: "tiny_test",
            args: vec!["data", "cls_bias"],
            aux: vec![],
        };
        let mut predictor = engine().bind(request(&network)).unwrap();
        assert_eq!(predictor.envelope()[0].shape, vec![1, 3, 8, 8]);

        let raw = predictor.predict(&batch(8, 6)).unwrap();
        assert_eq!(raw.num_classes(), 2);
        let dets = raw.candidates(1, 2.0);
        assert_eq!(dets[0].bbox, [0.0, 0.0, 2.5, 3.5]);
        assert!((dets[0].score - 0.9).abs() < 1e-6);

        // a smaller image reuses the same binding
        assert!(predictor.predict(&batch(4, 4)).is_ok());
    }

    #[test]
    fn test_predict_outside_envelope_fails() {
        let network = NamesOnly {
            entry: "tiny_test",
            args: vec!["data", "cls_bias"],
            aux: vec![],
        };
        let mut predictor = engine().bind(request(&network)).unwrap();

        assert!(matches!(
            predictor.predict(&batch(16, 8)),
            Err(Error::BindFailure(_))
        ));
    }

    #[test]
    fn test_unregistered_graph_is_bind_failure() {
        let network = NamesOnly {
            entry: "resnet_fpn_test",
            args: vec!["data"],
            aux: vec![],
        };

        assert!(matches!(
            engine().bind(request(&network)),
            Err(Error::BindFailure(msg)) if msg.contains("resnet_fpn_test")
        ));
    }
}
