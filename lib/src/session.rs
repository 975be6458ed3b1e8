use crate::{
    errors::InvalidRange,
    extractor::{FeatureExtractor, FeatureMaps, Vgg},
    loss::total_loss,
    utils::{image_to_tensor, load_image, tensor_to_image},
    CpuBackend, Dims, Error, ImageSource, Parameters, StyleSnapshot, StylizedImage,
};
use burn::{
    module::{Module, Param},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use std::{
    path::Path,
    time::{Duration, Instant},
};

/// Stylization session.
///
/// Calling `run()` optimizes a copy of the content image against the content
/// and style features and returns the result, consuming the session in the
/// process. You can provide a `StylizeProgress` implementation to get the
/// loss of every iteration.
///
/// # Example
/// ```no_run
/// use neural_style as ns;
///
/// let device = Default::default();
/// let extractor = ns::Vgg::<ns::CpuBackend>::from_safetensors(
///     "vgg19.safetensors",
///     &ns::ExtractorConfig::vgg19(),
///     &device,
/// )
/// .expect("failed to load weights");
///
/// let session = ns::Session::builder()
///     .content(&"imgs/city.jpg")
///     .style_cache(&"starry_night.snap")
///     .epochs(200)
///     .build(&extractor, &device)
///     .expect("failed to build session");
///
/// let stylized = session.run(None).expect("failed to stylize");
/// stylized.save("city_stylized.png").expect("failed to save image");
/// ```
pub struct Session<'e, B: AutodiffBackend, E> {
    extractor: &'e E,
    content: Tensor<B, 4>,
    style_features: FeatureMaps<B>,
    params: Parameters,
}

/// The only trainable value of a session, the pixels being optimized
#[derive(Module, Debug)]
pub struct GeneratedPixels<B: Backend> {
    pixels: Param<Tensor<B, 4>>,
}

impl<B: Backend> GeneratedPixels<B> {
    fn new(initial: Tensor<B, 4>) -> Self {
        Self {
            pixels: Param::from_tensor(initial),
        }
    }
}

impl Session<'_, CpuBackend, Vgg<CpuBackend>> {
    /// Creates a new session with default parameters. The builder is not tied
    /// to a backend, that is picked when calling `build`.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }
}

impl<'e, B, E> Session<'e, B, E>
where
    B: AutodiffBackend,
    E: FeatureExtractor<B>,
{
    /// Runs the optimization loop and outputs the stylized image.
    pub fn run(
        self,
        mut progress: Option<Box<dyn StylizeProgress + '_>>,
    ) -> Result<StylizedImage, Error> {
        let content_features: FeatureMaps<B> = self
            .extractor
            .extract(self.content.clone())?
            .into_iter()
            .map(Tensor::detach)
            .collect();

        let weights = self.params.loss_weights();
        let total = self.params.epochs;

        let mut generated = GeneratedPixels::new(self.content);
        let mut optim = AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-8)
            .init();

        tracing::info!(
            epochs = total,
            learning_rate = self.params.learning_rate,
            "starting stylization"
        );

        let started = Instant::now();

        for iteration in 0..total {
            if let Some(limit) = self.params.time_limit {
                if started.elapsed() >= limit {
                    return Err(Error::Optimization(format!(
                        "time limit of {:?} exceeded after {} of {} iterations",
                        limit, iteration, total
                    )));
                }
            }

            let features = self.extractor.extract(generated.pixels.val())?;
            let loss = total_loss(&features, &content_features, &self.style_features, weights)?;

            let loss_value = loss.clone().into_scalar().elem::<f32>();
            if !loss_value.is_finite() {
                return Err(Error::Optimization(format!(
                    "loss became {} at iteration {}",
                    loss_value, iteration
                )));
            }

            let grads = GradientsParams::from_grads(loss.backward(), &generated);
            generated = optim.step(self.params.learning_rate, generated, grads);

            if iteration % self.params.report_every == 0 {
                tracing::info!(iteration, loss = loss_value, "stylizing");
            }

            if let Some(ref mut progress) = progress {
                progress.update(ProgressUpdate {
                    iteration,
                    total,
                    loss: loss_value,
                });
            }
        }

        tracing::info!(
            elapsed = ?started.elapsed(),
            "finished stylization"
        );

        Ok(StylizedImage {
            inner: tensor_to_image(generated.pixels.val().inner())?,
        })
    }
}

enum StyleSource<'a> {
    Cache(&'a Path),
    Snapshot(&'a StyleSnapshot),
}

/// Builds a session by setting parameters and the input images, calling
/// `build` will check all of the provided inputs and load them onto the
/// device
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<StyleSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure is preserved. It is resized to the session
    /// resolution, and is also the starting point of the optimization.
    pub fn content<I: Into<ImageSource<'a>>>(mut self, content: I) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Loads the style features from a snapshot file written by
    /// `extract_style`
    pub fn style_cache<P: AsRef<Path> + ?Sized>(mut self, path: &'a P) -> Self {
        self.style = Some(StyleSource::Cache(path.as_ref()));
        self
    }

    /// Uses style features that were already loaded, eg to apply one style to
    /// many content images
    pub fn style_snapshot(mut self, snapshot: &'a StyleSnapshot) -> Self {
        self.style = Some(StyleSource::Snapshot(snapshot));
        self
    }

    /// The number of optimization iterations.
    ///
    /// A single iteration barely changes the content image, real use needs
    /// hundreds.
    ///
    /// Default: 1
    pub fn epochs(mut self, count: usize) -> Self {
        self.params.epochs = count;
        self
    }

    /// Step size of the optimizer, in units of normalized pixel values.
    ///
    /// Default: 0.004
    pub fn learning_rate(mut self, value: f64) -> Self {
        self.params.learning_rate = value;
        self
    }

    /// Weight of the content loss, also known as alpha.
    ///
    /// Default: 8.0
    pub fn content_weight(mut self, value: f32) -> Self {
        self.params.content_weight = value;
        self
    }

    /// Weight of the style loss, also known as beta.
    ///
    /// Default: 70.0
    pub fn style_weight(mut self, value: f32) -> Self {
        self.params.style_weight = value;
        self
    }

    /// Size the content image is resized to, which is also the size of the
    /// output. A style snapshot only fits sessions with the resolution it was
    /// extracted at.
    ///
    /// Default: 512x512
    pub fn resolution(mut self, dims: Dims) -> Self {
        self.params.resolution = dims;
        self
    }

    /// How often, in iterations, the loss is logged.
    ///
    /// Default: 100
    pub fn report_every(mut self, iterations: usize) -> Self {
        self.params.report_every = iterations;
        self
    }

    /// Aborts the run if it takes longer than `limit`. The deadline is
    /// checked between iterations.
    ///
    /// Default: no limit
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.params.time_limit = Some(limit);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or input
    /// images were specified.
    pub fn build<'e, B, E>(
        self,
        extractor: &'e E,
        device: &B::Device,
    ) -> Result<Session<'e, B, E>, Error>
    where
        B: AutodiffBackend,
        E: FeatureExtractor<B>,
    {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::NoContent)?;
        let style = self.style.ok_or(Error::NoStyle)?;

        let content_img = load_image(content, self.params.resolution)?;
        let content = image_to_tensor::<B>(&content_img, device);

        let style_features: FeatureMaps<B> = match style {
            StyleSource::Cache(path) => StyleSnapshot::load(path)?.to_features(device),
            StyleSource::Snapshot(snapshot) => snapshot.to_features(device),
        };

        if style_features.len() != extractor.layer_count() {
            return Err(Error::LayerCountMismatch(
                style_features.len(),
                extractor.layer_count(),
            ));
        }

        tracing::info!(
            width = self.params.resolution.width,
            height = self.params.resolution.height,
            layers = style_features.len(),
            "session initialized"
        );

        Ok(Session {
            extractor,
            content,
            style_features,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let lr = self.params.learning_rate;
        if !lr.is_finite() || lr < 0.0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 0.0,
                max: None,
                value: lr,
                name: "learning-rate",
            }));
        }

        for (name, weight) in [
            ("alpha", self.params.content_weight),
            ("beta", self.params.style_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 0.0,
                    max: None,
                    value: f64::from(weight),
                    name,
                }));
            }
        }

        let Dims { width, height } = self.params.resolution;
        if width == 0 || height == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: None,
                value: f64::from(width.min(height)),
                name: "size",
            }));
        }

        if self.params.report_every == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: None,
                value: 0.0,
                name: "report-every",
            }));
        }

        Ok(())
    }
}

/// The state of the optimization after one iteration
#[derive(Copy, Clone, Debug)]
pub struct ProgressUpdate {
    /// Zero based index of the iteration that just finished
    pub iteration: usize,
    /// The total number of iterations in the run
    pub total: usize,
    /// The total loss computed during the iteration
    pub loss: f32,
}

/// Allows the session to update external callers with the progress of the
/// optimization
pub trait StylizeProgress {
    fn update(&mut self, info: ProgressUpdate);
}

impl<G> StylizeProgress for G
where
    G: FnMut(ProgressUpdate) + Send,
{
    fn update(&mut self, info: ProgressUpdate) {
        self(info);
    }
}
