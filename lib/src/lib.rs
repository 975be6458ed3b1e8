// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a small API for neural style transfer: it synthesizes an
//! image that keeps the structure of a content image while taking on the
//! textures of a style image, by optimizing pixels against features of a
//! frozen convolutional network.
//!
//! Style transfer happens in two stages.
//!
//! 1. [`extract_style`] runs a [`FeatureExtractor`] once on a style image and
//! persists the resulting feature maps as a [`StyleSnapshot`].
//! 2. A [`Session`], built via a [`SessionBuilder`], loads a content image and
//! a snapshot and runs gradient descent on a copy of the content image. The
//! result is returned as a [`StylizedImage`], or written straight to disk with
//! [`stylize`].
//!
//! Both entry points remove whatever exists at their output path when they
//! fail, so a failed run never leaves a partial snapshot or image behind.
//!
//! ## Usage
//!
//! ```no_run
//! use neural_style as ns;
//!
//! let device = Default::default();
//! let extractor = ns::Vgg::<ns::CpuBackend>::from_safetensors(
//!     "vgg19.safetensors",
//!     &ns::ExtractorConfig::vgg19(),
//!     &device,
//! )
//! .expect("failed to load weights");
//!
//! // Extract the style once...
//! ns::extract_style(
//!     &extractor,
//!     &device,
//!     &"imgs/starry_night.jpg",
//!     ns::Dims::square(512),
//!     "starry_night.snap",
//! )
//! .expect("failed to extract style");
//!
//! // ...and apply it to as many content images as you like
//! let builder = ns::Session::builder()
//!     .content(&"imgs/city.jpg")
//!     .style_cache(&"starry_night.snap")
//!     .epochs(300);
//!
//! ns::stylize(&extractor, &device, builder, "city_stylized.png", None)
//!     .expect("failed to stylize");
//! ```
mod errors;
pub mod extractor;
pub mod loss;
pub mod session;
mod snapshot;
mod utils;

pub use image;
use std::{
    io::{Seek, Write},
    path::Path,
    time::Duration,
};

use burn::tensor::backend::{AutodiffBackend, Backend};
pub use errors::Error;
pub use extractor::{ExtractorConfig, FeatureExtractor, FeatureMaps, Stage, Vgg};
pub use loss::LossWeights;
pub use session::{ProgressUpdate, Session, SessionBuilder, StylizeProgress};
pub use snapshot::StyleSnapshot;
pub use utils::{is_image_file, load_dynamic_image, ImageSource};

/// The backend used when no accelerator is requested: `ndarray` on the CPU,
/// with gradient tracking
pub type CpuBackend = burn::backend::Autodiff<burn::backend::NdArray>;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

struct Parameters {
    epochs: usize,
    learning_rate: f64,
    content_weight: f32,
    style_weight: f32,
    resolution: Dims,
    report_every: usize,
    time_limit: Option<Duration>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 0.004,
            content_weight: 8.0,
            style_weight: 70.0,
            resolution: Dims::square(512),
            report_every: 100,
            time_limit: None,
        }
    }
}

impl Parameters {
    fn loss_weights(&self) -> LossWeights {
        LossWeights {
            content: self.content_weight,
            style: self.style_weight,
        }
    }
}

/// An image generated by a `Session::run()`
pub struct StylizedImage {
    inner: image::RgbImage,
}

impl StylizedImage {
    /// Saves the stylized image to the specified path, the format is chosen
    /// from the extension. If writing fails the partial file is removed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let fmt = utils::output_format(path)?;

        utils::persist(path, |w| self.write(w, fmt))
    }

    /// Writes the stylized image to the specified stream
    pub fn write<W: Write + Seek>(
        &self,
        writer: &mut W,
        fmt: image::ImageFormat,
    ) -> Result<(), Error> {
        let dyn_img = image::DynamicImage::ImageRgb8(self.inner.clone());
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// Returns the stylized output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.inner)
    }
}

impl AsRef<image::RgbImage> for StylizedImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.inner
    }
}

fn abort(path: &Path, err: Error) -> Error {
    tracing::error!(path = %path.display(), error = %err, "aborted");
    utils::discard(path);
    err
}

/// Extracts the features of a style image, resized to `resolution`, and saves
/// them as a [`StyleSnapshot`] at `output`.
///
/// On failure whatever exists at `output` is removed before the error is
/// returned.
pub fn extract_style<'a, B, E, I, P>(
    extractor: &E,
    device: &B::Device,
    style: I,
    resolution: Dims,
    output: P,
) -> Result<StyleSnapshot, Error>
where
    B: Backend,
    E: FeatureExtractor<B>,
    I: Into<ImageSource<'a>>,
    P: AsRef<Path>,
{
    let output = output.as_ref();

    match save_style(extractor, device, style.into(), resolution, output) {
        Ok(snapshot) => {
            tracing::info!(
                path = %output.display(),
                layers = snapshot.len(),
                "saved style snapshot"
            );
            Ok(snapshot)
        }
        Err(err) => Err(abort(output, err)),
    }
}

fn save_style<B: Backend, E: FeatureExtractor<B>>(
    extractor: &E,
    device: &B::Device,
    style: ImageSource<'_>,
    resolution: Dims,
    output: &Path,
) -> Result<StyleSnapshot, Error> {
    let img = utils::load_image(style, resolution)?;
    let features = extractor.extract(utils::image_to_tensor::<B>(&img, device))?;

    for (layer, map) in features.iter().enumerate() {
        tracing::debug!(layer, dims = ?map.dims(), "style features");
    }

    let snapshot = StyleSnapshot::from_features(&features)?;
    snapshot.save(output)?;
    Ok(snapshot)
}

/// Builds a session from `builder`, runs it to completion and saves the
/// result to `output`.
///
/// The output format is checked before any work is done. Any failure after
/// that removes whatever exists at `output` before the error is returned.
pub fn stylize<'a, B, E, P>(
    extractor: &E,
    device: &B::Device,
    builder: SessionBuilder<'a>,
    output: P,
    progress: Option<Box<dyn StylizeProgress + '_>>,
) -> Result<(), Error>
where
    B: AutodiffBackend,
    E: FeatureExtractor<B>,
    P: AsRef<Path>,
{
    let output = output.as_ref();
    utils::output_format(output)?;

    let result = builder
        .build(extractor, device)
        .and_then(|session| session.run(progress))
        .and_then(|stylized| stylized.save(output));

    match result {
        Ok(()) => {
            tracing::info!(path = %output.display(), "saved stylized image");
            Ok(())
        }
        Err(err) => Err(abort(output, err)),
    }
}
