//! Content and style losses between feature maps.

use crate::{errors::ShapeMismatch, Error};
use burn::tensor::{backend::Backend, Tensor};

/// Relative importance of content and style in the total loss
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    /// Weight of the summed content losses, often called alpha
    pub content: f32,
    /// Weight of the summed style losses, often called beta
    pub style: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            content: 8.0,
            style: 70.0,
        }
    }
}

fn check_pair<B: Backend>(
    generated: &Tensor<B, 4>,
    reference: &Tensor<B, 4>,
    context: impl FnOnce() -> String,
) -> Result<(), Error> {
    let (found, expected) = (generated.dims(), reference.dims());
    if found != expected {
        return Err(ShapeMismatch {
            context: context(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
        .into());
    }
    Ok(())
}

/// Mean squared difference between two feature maps of identical shape
pub fn content_loss<B: Backend>(
    generated: Tensor<B, 4>,
    reference: Tensor<B, 4>,
) -> Result<Tensor<B, 1>, Error> {
    check_pair(&generated, &reference, || "content feature map".to_owned())?;
    Ok(generated.sub(reference).powf_scalar(2.0).mean())
}

/// The `channels x channels` correlation matrix of a single feature map
pub fn gram_matrix<B: Backend>(map: Tensor<B, 4>) -> Result<Tensor<B, 2>, Error> {
    let [batch, channels, height, width] = map.dims();
    if batch != 1 {
        return Err(ShapeMismatch {
            context: "gram matrix input".to_owned(),
            expected: vec![1, channels, height, width],
            found: vec![batch, channels, height, width],
        }
        .into());
    }

    let flat = map.reshape([channels, height * width]);
    Ok(flat.clone().matmul(flat.transpose()))
}

/// Mean squared difference between the gram matrices of two feature maps
pub fn style_loss<B: Backend>(
    generated: Tensor<B, 4>,
    reference: Tensor<B, 4>,
) -> Result<Tensor<B, 1>, Error> {
    check_pair(&generated, &reference, || "style feature map".to_owned())?;

    let g = gram_matrix(generated)?;
    let a = gram_matrix(reference)?;
    Ok(g.sub(a).powf_scalar(2.0).mean())
}

/// `weights.content * Σ content_loss + weights.style * Σ style_loss` over
/// every layer. All three sets must come from the same extractor
/// configuration.
pub fn total_loss<B: Backend>(
    generated: &[Tensor<B, 4>],
    content: &[Tensor<B, 4>],
    style: &[Tensor<B, 4>],
    weights: LossWeights,
) -> Result<Tensor<B, 1>, Error> {
    if content.len() != generated.len() {
        return Err(Error::LayerCountMismatch(content.len(), generated.len()));
    }
    if style.len() != generated.len() {
        return Err(Error::LayerCountMismatch(style.len(), generated.len()));
    }

    let mut content_sum: Option<Tensor<B, 1>> = None;
    let mut style_sum: Option<Tensor<B, 1>> = None;

    for (layer, ((g, c), s)) in generated.iter().zip(content).zip(style).enumerate() {
        // Check both pairs up front so a mismatch reports the layer instead
        // of the generic map description
        check_pair(g, c, || format!("content features of layer {}", layer))?;
        check_pair(g, s, || format!("style features of layer {}", layer))?;

        let cl = content_loss(g.clone(), c.clone())?;
        let sl = style_loss(g.clone(), s.clone())?;

        content_sum = Some(match content_sum {
            Some(sum) => sum + cl,
            None => cl,
        });
        style_sum = Some(match style_sum {
            Some(sum) => sum + sl,
            None => sl,
        });
    }

    match (content_sum, style_sum) {
        (Some(c), Some(s)) => Ok(c.mul_scalar(weights.content) + s.mul_scalar(weights.style)),
        _ => Err(Error::NoFeatures),
    }
}
