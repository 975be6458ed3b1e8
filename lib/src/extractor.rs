//! Frozen VGG-style convolutional trunk used to turn images into feature maps.
//!
//! The network is described by an [`ExtractorConfig`]: a plan of stages, where
//! every `Conv` stage expands into a 3x3 convolution followed by a ReLU, and
//! every `Pool` stage into a 2x2 max pooling. Layers are indexed from the
//! input in that expanded order, which is the same numbering torchvision uses
//! for `vgg19().features`, so the reference capture points `0, 5, 10, 19, 28`
//! refer to the first convolution of each block.

use crate::{
    errors::{ModelLoad, ShapeMismatch},
    Error,
};
use burn::{
    module::{Module, Param},
    tensor::{
        activation::relu,
        backend::Backend,
        module::{conv2d, max_pool2d},
        ops::ConvOptions,
        Tensor, TensorData,
    },
};
use rand::{Rng, SeedableRng};
use safetensors::{tensor::Dtype, SafeTensors};
use std::path::Path;

/// The ordered feature maps captured for one image, one per monitored layer
pub type FeatureMaps<B> = Vec<Tensor<B, 4>>;

/// Anything that can map an image tensor to an ordered set of feature maps.
///
/// Implementations must be deterministic and must not expose trainable
/// parameters: the only tensor that can receive gradients through `extract`
/// is the image passed in.
pub trait FeatureExtractor<B: Backend> {
    /// The number of feature maps every call to `extract` returns
    fn layer_count(&self) -> usize;

    /// Runs the network on a `[1, 3, height, width]` image tensor
    fn extract(&self, image: Tensor<B, 4>) -> Result<FeatureMaps<B>, Error>;
}

/// One entry of the network plan
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// 3x3 convolution with padding 1 producing the given number of
    /// channels, followed by a ReLU
    Conv(usize),
    /// 2x2 max pooling with stride 2
    Pool,
}

const VGG19_STAGES: [Stage; 21] = [
    Stage::Conv(64),
    Stage::Conv(64),
    Stage::Pool,
    Stage::Conv(128),
    Stage::Conv(128),
    Stage::Pool,
    Stage::Conv(256),
    Stage::Conv(256),
    Stage::Conv(256),
    Stage::Conv(256),
    Stage::Pool,
    Stage::Conv(512),
    Stage::Conv(512),
    Stage::Conv(512),
    Stage::Conv(512),
    Stage::Pool,
    Stage::Conv(512),
    Stage::Conv(512),
    Stage::Conv(512),
    Stage::Conv(512),
    Stage::Pool,
];

/// The layers captured by the reference configuration
pub const VGG19_CAPTURE: [usize; 5] = [0, 5, 10, 19, 28];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Layer {
    Conv {
        slot: usize,
        in_channels: usize,
        out_channels: usize,
    },
    Relu,
    MaxPool,
}

/// The architecture of a feature extractor and the layers it captures
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractorConfig {
    stages: Vec<Stage>,
    capture: Vec<usize>,
}

impl ExtractorConfig {
    /// Creates a configuration from a plan and the (strictly increasing)
    /// indices of the layers whose output is captured
    pub fn new(stages: Vec<Stage>, capture: Vec<usize>) -> Self {
        Self { stages, capture }
    }

    /// VGG19 capturing `conv1_1`, `conv2_1`, `conv3_1`, `conv4_1` and `conv5_1`
    pub fn vgg19() -> Self {
        Self::new(VGG19_STAGES.to_vec(), VGG19_CAPTURE.to_vec())
    }

    pub fn capture(&self) -> &[usize] {
        &self.capture
    }

    /// Expands the plan into individual layers, truncated after the last
    /// captured one
    fn layers(&self) -> Result<Vec<Layer>, Error> {
        let mut layers = Vec::new();
        let mut in_channels = 3;
        let mut slot = 0;

        for stage in &self.stages {
            match *stage {
                Stage::Conv(0) => {
                    return Err(Error::InvalidExtractor(
                        "a convolution must produce at least 1 channel".to_owned(),
                    ))
                }
                Stage::Conv(out_channels) => {
                    layers.push(Layer::Conv {
                        slot,
                        in_channels,
                        out_channels,
                    });
                    layers.push(Layer::Relu);
                    in_channels = out_channels;
                    slot += 1;
                }
                Stage::Pool => layers.push(Layer::MaxPool),
            }
        }

        let last = match self.capture.last() {
            Some(last) => *last,
            None => {
                return Err(Error::InvalidExtractor(
                    "at least 1 layer must be captured".to_owned(),
                ))
            }
        };

        if self.capture.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(Error::InvalidExtractor(format!(
                "captured layers {:?} are not strictly increasing",
                self.capture
            )));
        }

        if last >= layers.len() {
            return Err(Error::InvalidExtractor(format!(
                "layer {} was requested, but the network only has {} layers",
                last,
                layers.len()
            )));
        }

        layers.truncate(last + 1);
        Ok(layers)
    }
}

#[derive(Module, Debug)]
struct ConvLayer<B: Backend> {
    weight: Param<Tensor<B, 4>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> ConvLayer<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        conv2d(
            x,
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new([1, 1], [1, 1], [1, 1], 1),
        )
    }
}

#[derive(Module, Debug)]
struct Trunk<B: Backend> {
    convs: Vec<ConvLayer<B>>,
}

/// A VGG-style feature extractor with frozen weights
#[derive(Debug)]
pub struct Vgg<B: Backend> {
    trunk: Trunk<B>,
    layers: Vec<Layer>,
    capture: Vec<usize>,
}

impl<B: Backend> Vgg<B> {
    /// Loads pretrained weights from a safetensors file using torchvision's
    /// naming, ie `features.{layer}.weight` and `features.{layer}.bias`
    pub fn from_safetensors<P: AsRef<Path>>(
        path: P,
        config: &ExtractorConfig,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let layers = config.layers()?;

        let fail = |reason: String| {
            Error::ModelLoad(ModelLoad {
                path: path.to_path_buf(),
                reason,
            })
        };

        let bytes = std::fs::read(path).map_err(|err| fail(err.to_string()))?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|err| fail(format!("{:?}", err)))?;

        let mut convs = Vec::new();
        for (index, layer) in layers.iter().enumerate() {
            if let Layer::Conv {
                in_channels,
                out_channels,
                ..
            } = *layer
            {
                let weight = read_tensor(
                    &tensors,
                    &format!("features.{}.weight", index),
                    [out_channels, in_channels, 3, 3],
                    device,
                )
                .map_err(fail)?;
                let bias = read_tensor(
                    &tensors,
                    &format!("features.{}.bias", index),
                    [out_channels],
                    device,
                )
                .map_err(fail)?;

                convs.push(ConvLayer {
                    weight: Param::from_tensor(weight),
                    bias: Param::from_tensor(bias),
                });
            }
        }

        tracing::debug!(
            path = %path.display(),
            convolutions = convs.len(),
            "loaded feature extractor weights"
        );

        Ok(Self::frozen(Trunk { convs }, layers, config))
    }

    /// Creates an extractor with deterministic, uniformly distributed weights.
    /// The features are meaningless for style transfer, but have the exact
    /// shapes of a pretrained network with the same configuration.
    pub fn seeded(config: &ExtractorConfig, seed: u64, device: &B::Device) -> Result<Self, Error> {
        let layers = config.layers()?;
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);

        let convs = layers
            .iter()
            .filter_map(|layer| match *layer {
                Layer::Conv {
                    in_channels,
                    out_channels,
                    ..
                } => Some((in_channels, out_channels)),
                _ => None,
            })
            .map(|(in_channels, out_channels)| {
                let fan_in = in_channels * 9;
                let limit = (6.0 / fan_in as f32).sqrt();
                let weight =
                    random_tensor(&mut rng, [out_channels, in_channels, 3, 3], limit, device);
                let bias = random_tensor(
                    &mut rng,
                    [out_channels],
                    (1.0 / fan_in as f32).sqrt(),
                    device,
                );

                ConvLayer {
                    weight: Param::from_tensor(weight),
                    bias: Param::from_tensor(bias),
                }
            })
            .collect();

        Ok(Self::frozen(Trunk { convs }, layers, config))
    }

    fn frozen(trunk: Trunk<B>, layers: Vec<Layer>, config: &ExtractorConfig) -> Self {
        Self {
            trunk: trunk.no_grad(),
            layers,
            capture: config.capture.clone(),
        }
    }

    /// The smallest input side length that survives every pooling layer
    fn min_input_size(&self) -> usize {
        let pools = self
            .layers
            .iter()
            .filter(|layer| **layer == Layer::MaxPool)
            .count();
        1 << pools
    }
}

impl<B: Backend> FeatureExtractor<B> for Vgg<B> {
    fn layer_count(&self) -> usize {
        self.capture.len()
    }

    fn extract(&self, image: Tensor<B, 4>) -> Result<FeatureMaps<B>, Error> {
        let [batch, channels, height, width] = image.dims();
        let min_size = self.min_input_size();
        if batch != 1 || channels != 3 {
            return Err(ShapeMismatch {
                context: "feature extractor input".to_owned(),
                expected: vec![1, 3, height, width],
                found: vec![batch, channels, height, width],
            }
            .into());
        }
        if height < min_size || width < min_size {
            return Err(Error::InputTooSmall(min_size, height, width));
        }

        let mut features = Vec::with_capacity(self.capture.len());
        let mut capture = self.capture.iter().peekable();
        let mut x = image;

        for (index, layer) in self.layers.iter().enumerate() {
            x = match *layer {
                Layer::Conv { slot, .. } => self.trunk.convs[slot].forward(x),
                Layer::Relu => relu(x),
                Layer::MaxPool => max_pool2d(x, [2, 2], [2, 2], [0, 0], [1, 1]),
            };

            if capture.peek() == Some(&&index) {
                features.push(x.clone());
                capture.next();
            }
        }

        Ok(features)
    }
}

fn read_tensor<B: Backend, const D: usize>(
    tensors: &SafeTensors<'_>,
    name: &str,
    shape: [usize; D],
    device: &B::Device,
) -> Result<Tensor<B, D>, String> {
    let view = tensors
        .tensor(name)
        .map_err(|err| format!("tensor '{}': {:?}", name, err))?;

    if view.dtype() != Dtype::F32 {
        return Err(format!(
            "tensor '{}' has dtype {:?}, only F32 is supported",
            name,
            view.dtype()
        ));
    }

    if view.shape() != &shape[..] {
        return Err(format!(
            "tensor '{}' has shape {:?}, expected {:?}",
            name,
            view.shape(),
            shape
        ));
    }

    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}

fn random_tensor<B: Backend, const D: usize>(
    rng: &mut rand_pcg::Pcg32,
    shape: [usize; D],
    limit: f32,
    device: &B::Device,
) -> Tensor<B, D> {
    let total: usize = shape.iter().product();
    let values: Vec<f32> = (0..total).map(|_| rng.gen_range(-limit..limit)).collect();

    Tensor::from_data(TensorData::new(values, shape), device)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::tensor_values;
    use burn::backend::{Autodiff, NdArray};

    type B = NdArray;

    fn tiny() -> ExtractorConfig {
        ExtractorConfig::new(
            vec![Stage::Conv(4), Stage::Pool, Stage::Conv(6), Stage::Pool, Stage::Conv(8)],
            vec![0, 3, 6],
        )
    }

    fn noise_image<BE: Backend>(seed: u64, size: usize) -> Tensor<BE, 4> {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
        let values: Vec<f32> = (0..3 * size * size).map(|_| rng.gen_range(0.0..1.0)).collect();
        Tensor::from_data(TensorData::new(values, [1, 3, size, size]), &Default::default())
    }

    #[test]
    fn vgg19_captures_first_conv_of_each_block() {
        let config = ExtractorConfig::vgg19();
        let layers = config.layers().unwrap();

        assert_eq!(layers.len(), 29);
        for index in VGG19_CAPTURE.iter() {
            assert!(matches!(layers[*index], Layer::Conv { .. }));
        }

        let channels: Vec<_> = VGG19_CAPTURE
            .iter()
            .map(|index| match layers[*index] {
                Layer::Conv { out_channels, .. } => out_channels,
                _ => 0,
            })
            .collect();
        assert_eq!(channels, vec![64, 128, 256, 512, 512]);
        assert_eq!(
            layers.iter().filter(|l| **l == Layer::MaxPool).count(),
            4
        );
    }

    #[test]
    fn rejects_invalid_capture_lists() {
        let stages = vec![Stage::Conv(4), Stage::Pool];

        let empty = ExtractorConfig::new(stages.clone(), vec![]);
        assert!(matches!(empty.layers(), Err(Error::InvalidExtractor(_))));

        let unordered = ExtractorConfig::new(stages.clone(), vec![1, 0]);
        assert!(matches!(unordered.layers(), Err(Error::InvalidExtractor(_))));

        let out_of_range = ExtractorConfig::new(stages.clone(), vec![3]);
        assert!(matches!(out_of_range.layers(), Err(Error::InvalidExtractor(_))));

        let no_channels = ExtractorConfig::new(vec![Stage::Conv(0)], vec![0]);
        assert!(matches!(no_channels.layers(), Err(Error::InvalidExtractor(_))));
    }

    #[test]
    fn feature_count_and_shapes_are_stable() {
        let device = Default::default();
        let vgg = Vgg::<B>::seeded(&tiny(), 7, &device).unwrap();
        assert_eq!(vgg.layer_count(), 3);

        let first = vgg.extract(noise_image(1, 16)).unwrap();
        let second = vgg.extract(noise_image(2, 16)).unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);

        let dims: Vec<_> = first.iter().map(|f| f.dims()).collect();
        assert_eq!(dims, vec![[1, 4, 16, 16], [1, 6, 8, 8], [1, 8, 4, 4]]);
        assert_eq!(dims, second.iter().map(|f| f.dims()).collect::<Vec<_>>());
    }

    #[test]
    fn extraction_is_deterministic() {
        let device = Default::default();
        let a = Vgg::<B>::seeded(&tiny(), 3, &device).unwrap();
        let b = Vgg::<B>::seeded(&tiny(), 3, &device).unwrap();

        let fa = a.extract(noise_image(5, 8)).unwrap();
        let fb = b.extract(noise_image(5, 8)).unwrap();

        for (x, y) in fa.into_iter().zip(fb) {
            assert_eq!(tensor_values(x).unwrap(), tensor_values(y).unwrap());
        }
    }

    #[test]
    fn rejects_malformed_input() {
        let device = Default::default();
        let vgg = Vgg::<B>::seeded(&tiny(), 0, &device).unwrap();

        let gray = Tensor::<B, 4>::zeros([1, 1, 16, 16], &device);
        assert!(matches!(vgg.extract(gray), Err(Error::ShapeMismatch(_))));

        // 2 pooling layers need at least 4 pixels per side
        let tiny_img = Tensor::<B, 4>::zeros([1, 3, 2, 8], &device);
        assert!(matches!(
            vgg.extract(tiny_img),
            Err(Error::InputTooSmall(4, 2, 8))
        ));
    }

    #[test]
    fn gradients_only_reach_the_input() {
        type AD = Autodiff<NdArray>;

        let device = Default::default();
        let vgg = Vgg::<AD>::seeded(&tiny(), 11, &device).unwrap();

        let input = noise_image::<AD>(9, 8).require_grad();
        let features = vgg.extract(input.clone()).unwrap();
        let loss = features
            .into_iter()
            .map(|f| f.powf_scalar(2.0).sum())
            .reduce(|a, b| a + b)
            .unwrap();

        let grads = loss.backward();

        assert!(input.grad(&grads).is_some());
        for conv in &vgg.trunk.convs {
            assert!(conv.weight.val().grad(&grads).is_none());
            assert!(conv.bias.val().grad(&grads).is_none());
        }
    }

    fn export_safetensors(vgg: &Vgg<B>) -> Vec<u8> {
        let mut entries = Vec::new();
        let mut convs = vgg.trunk.convs.iter();

        for (index, layer) in vgg.layers.iter().enumerate() {
            if let Layer::Conv { .. } = layer {
                let conv = convs.next().unwrap();
                let weight = conv.weight.val();
                let bias = conv.bias.val();

                entries.push((
                    format!("features.{}.weight", index),
                    weight.dims().to_vec(),
                    tensor_values(weight).unwrap(),
                ));
                entries.push((
                    format!("features.{}.bias", index),
                    bias.dims().to_vec(),
                    tensor_values(bias).unwrap(),
                ));
            }
        }

        let raw: Vec<(String, Vec<usize>, Vec<u8>)> = entries
            .into_iter()
            .map(|(name, shape, values)| {
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name, shape, bytes)
            })
            .collect();

        let views: Vec<(String, safetensors::tensor::TensorView<'_>)> = raw
            .iter()
            .map(|(name, shape, bytes)| {
                (
                    name.clone(),
                    safetensors::tensor::TensorView::new(Dtype::F32, shape.clone(), bytes)
                        .unwrap(),
                )
            })
            .collect();

        safetensors::serialize(views, &None).unwrap()
    }

    #[test]
    fn loads_weights_from_safetensors() {
        let device = Default::default();
        let reference = Vgg::<B>::seeded(&tiny(), 21, &device).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.safetensors");
        std::fs::write(&path, export_safetensors(&reference)).unwrap();

        let loaded = Vgg::<B>::from_safetensors(&path, &tiny(), &device).unwrap();

        let expected = reference.extract(noise_image(4, 8)).unwrap();
        let actual = loaded.extract(noise_image(4, 8)).unwrap();
        for (x, y) in expected.into_iter().zip(actual) {
            assert_eq!(tensor_values(x).unwrap(), tensor_values(y).unwrap());
        }
    }

    #[test]
    fn missing_weights_fail_to_load() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("nope.safetensors");
        assert!(matches!(
            Vgg::<B>::from_safetensors(&missing, &tiny(), &device),
            Err(Error::ModelLoad(_))
        ));

        // Weights for a smaller network don't cover the requested layers
        let small = ExtractorConfig::new(vec![Stage::Conv(4)], vec![0]);
        let reference = Vgg::<B>::seeded(&small, 1, &device).unwrap();
        let path = dir.path().join("small.safetensors");
        std::fs::write(&path, export_safetensors(&reference)).unwrap();

        assert!(matches!(
            Vgg::<B>::from_safetensors(&path, &tiny(), &device),
            Err(Error::ModelLoad(_))
        ));
    }
}
