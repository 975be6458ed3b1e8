use crate::{errors::ShapeMismatch, Dims, Error};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use std::{
    fs,
    io::{self, BufWriter, Write},
    path::Path,
};

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the pipeline
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + ?Sized + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Loads an image as RGB, resizing it to `size` unless it already matches
pub(crate) fn load_image(src: ImageSource<'_>, size: Dims) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?.to_rgb8();

    let img = if img.width() != size.width || img.height() != size.height {
        image::imageops::resize(
            &img,
            size.width,
            size.height,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    Ok(img)
}

/// Converts an RGB image into a `[1, 3, height, width]` tensor with values in
/// `[0, 1]`
pub(crate) fn image_to_tensor<B: Backend>(
    img: &image::RgbImage,
    device: &B::Device,
) -> Tensor<B, 4> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let plane = width * height;
    let mut values = vec![0f32; 3 * plane];

    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for (c, channel) in pixel.0.iter().enumerate() {
            values[c * plane + offset] = f32::from(*channel) / 255.0;
        }
    }

    Tensor::from_data(TensorData::new(values, [1, 3, height, width]), device)
}

/// Converts a `[1, 3, height, width]` tensor back into an RGB image, clamping
/// values to `[0, 1]` first
pub(crate) fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> Result<image::RgbImage, Error> {
    let [batch, channels, height, width] = tensor.dims();
    if batch != 1 || channels != 3 {
        return Err(ShapeMismatch {
            context: "generated image".to_owned(),
            expected: vec![1, 3, height, width],
            found: vec![batch, channels, height, width],
        }
        .into());
    }

    let values = tensor_values(tensor.clamp(0.0, 1.0))?;
    let plane = width * height;

    let mut img = image::RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let offset = y as usize * width + x as usize;
        for (c, channel) in pixel.0.iter_mut().enumerate() {
            *channel = (values[c * plane + offset] * 255.0).round() as u8;
        }
    }

    Ok(img)
}

pub(crate) fn tensor_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, Error> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{:?}", err)))
}

/// Determines the image format to write from the extension of `path`
pub(crate) fn output_format(path: &Path) -> Result<image::ImageFormat, Error> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => Ok(image::ImageFormat::Png),
        Some("jpg") | Some("jpeg") => Ok(image::ImageFormat::Jpeg),
        Some("bmp") => Ok(image::ImageFormat::Bmp),
        Some(other) => Err(Error::UnsupportedOutputFormat(other.to_owned())),
        None => Err(Error::UnsupportedOutputFormat(String::new())),
    }
}

/// Returns true if the path has one of the image extensions accepted for
/// batch stylization
pub fn is_image_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("jpg") | Some("jpeg") | Some("png")
    )
}

/// Creates `path` and hands a buffered writer to `write`. If anything fails
/// the file is removed again, so a failed write never leaves a truncated
/// artifact behind.
pub(crate) fn persist<F>(path: &Path, write: F) -> Result<(), Error>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> Result<(), Error>,
{
    let result: Result<(), Error> = (|| {
        if let Some(parent_path) = path.parent() {
            fs::create_dir_all(parent_path)?;
        }

        let mut writer = BufWriter::new(fs::File::create(path)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        discard(path);
    }

    result
}

/// Best effort removal of whatever exists at `path`. A failure to remove is
/// only reported, the caller is already handling the error that got it here.
pub(crate) fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "removed incomplete output"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(
            path = %path.display(),
            error = %err,
            "unable to remove incomplete output"
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn image_tensor_conversion_is_lossless() {
        let img = image::RgbImage::from_fn(5, 3, |x, y| {
            image::Rgb([(x * 50) as u8, (y * 80) as u8, (x * y * 17) as u8])
        });

        let tensor = image_to_tensor::<B>(&img, &Default::default());
        assert_eq!(tensor.dims(), [1, 3, 3, 5]);

        let back = tensor_to_image(tensor).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn tensor_channels_are_planar() {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 51]));
        let values = tensor_values(image_to_tensor::<B>(&img, &Default::default())).unwrap();

        assert!(values[..4].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(values[4..8].iter().all(|v| *v == 0.0));
        assert!(values[8..].iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let tensor = Tensor::<B, 4>::from_data(
            TensorData::new(vec![-1.0f32, 2.0, 0.5], [1, 3, 1, 1]),
            &Default::default(),
        );

        let img = tensor_to_image(tensor).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 255, 128]);
    }

    #[test]
    fn loads_and_resizes_to_requested_dims() {
        let src = image::DynamicImage::ImageRgb8(image::RgbImage::new(40, 10));
        let img = load_image(src.into(), Dims::square(16)).unwrap();
        assert_eq!(img.dimensions(), (16, 16));
    }

    #[test]
    fn output_format_from_extension() {
        assert_eq!(
            output_format(Path::new("a/b.PNG")).unwrap(),
            image::ImageFormat::Png
        );
        assert_eq!(
            output_format(Path::new("b.jpeg")).unwrap(),
            image::ImageFormat::Jpeg
        );
        assert!(matches!(
            output_format(Path::new("b.tga")),
            Err(Error::UnsupportedOutputFormat(ext)) if ext == "tga"
        ));
        assert!(output_format(Path::new("noext")).is_err());
    }

    #[test]
    fn image_file_filter() {
        assert!(is_image_file(Path::new("x/a.JPG")));
        assert!(is_image_file(Path::new("a.jpeg")));
        assert!(is_image_file(Path::new("a.png")));
        assert!(!is_image_file(Path::new("a.snap")));
        assert!(!is_image_file(Path::new("png")));
    }

    #[test]
    fn failed_write_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("partial.snap");

        let result = persist(&path, |w| {
            w.write_all(&[1, 2, 3, 4])?;
            w.flush()?;
            Err(Error::InvalidSnapshot("simulated failure".to_owned()))
        });

        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
        assert!(!path.exists());
    }

    #[test]
    fn successful_write_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.bin");

        persist(&path, |w| Ok(w.write_all(b"done")?)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"done");
    }
}
