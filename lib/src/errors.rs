use std::{fmt, path::PathBuf};

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f64,
    /// `None` for parameters that are only bounded from below
    pub(crate) max: Option<f64>,
    pub(crate) value: f64,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(
                f,
                "parameter '{}' - value '{}' is outside the range of {}-{}",
                self.name, self.value, self.min, max
            ),
            None => write!(
                f,
                "parameter '{}' - value '{}' must be a number of at least {}",
                self.name, self.value, self.min
            ),
        }
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) context: String,
    pub(crate) expected: Vec<usize>,
    pub(crate) found: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected shape {:?}, found {:?}",
            self.context, self.expected, self.found
        )
    }
}

#[derive(Debug)]
pub struct ModelLoad {
    pub(crate) path: PathBuf,
    pub(crate) reason: String,
}

impl fmt::Display for ModelLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to load model weights from '{}': {}",
            self.path.display(),
            self.reason
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The pretrained weights for the feature extractor could not be loaded
    ModelLoad(ModelLoad),
    /// The feature extractor configuration doesn't describe a usable network
    InvalidExtractor(String),
    /// Two tensors that must agree in shape did not, which usually means a
    /// snapshot was produced by a different extractor configuration
    ShapeMismatch(ShapeMismatch),
    /// The number of feature maps in two sets differed, (found, expected)
    LayerCountMismatch(usize, usize),
    /// Losses were requested over empty feature sets
    NoFeatures,
    /// The input image is smaller than the extractor's pooling allows,
    /// (minimum side, height, width)
    InputTooSmall(usize, usize, usize),
    /// Encoding or decoding a style snapshot failed
    Serialization(bincode::Error),
    /// A style snapshot was readable but its contents are not valid
    InvalidSnapshot(String),
    /// Tensor data could not be converted to the requested element type
    TensorData(String),
    /// The optimization loop could not continue
    Optimization(String),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// No content image was provided to the session
    NoContent,
    /// No style snapshot was provided to the session
    NoStyle,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::ModelLoad(ml) => write!(f, "{}", ml),
            Self::InvalidExtractor(reason) => {
                write!(f, "invalid feature extractor configuration: {}", reason)
            }
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::LayerCountMismatch(found, expected) => write!(
                f,
                "{} feature map(s) were provided, but {} is/are required",
                found, expected
            ),
            Self::NoFeatures => write!(f, "no feature maps were provided to compare"),
            Self::InputTooSmall(min, height, width) => write!(
                f,
                "the feature extractor needs images of at least {0}x{0} pixels, found {1}x{2}",
                min, width, height
            ),
            Self::Serialization(se) => write!(f, "style snapshot serialization failed: {}", se),
            Self::InvalidSnapshot(reason) => write!(f, "invalid style snapshot: {}", reason),
            Self::TensorData(reason) => write!(f, "unable to read tensor data: {}", reason),
            Self::Optimization(reason) => write!(f, "optimization failed: {}", reason),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::NoContent => write!(f, "a content image must be provided"),
            Self::NoStyle => write!(f, "a style snapshot must be provided"),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<bincode::Error> for Error {
    fn from(se: bincode::Error) -> Self {
        Self::Serialization(se)
    }
}

impl From<ShapeMismatch> for Error {
    fn from(sm: ShapeMismatch) -> Self {
        Self::ShapeMismatch(sm)
    }
}
