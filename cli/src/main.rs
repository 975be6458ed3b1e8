mod progress;

use structopt::StructOpt;

use burn::tensor::backend::AutodiffBackend;
use neural_style::{
    is_image_file, CpuBackend, Dims, ExtractorConfig, Session, SessionBuilder, StyleSnapshot,
    StylizeProgress, Vgg,
};
use progress::ProgressBarReporter;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

fn parse_size(input: &str) -> Result<(u32, u32), std::num::ParseIntError> {
    let mut i = input.splitn(2, 'x');

    let x: u32 = i.next().unwrap_or("").parse()?;
    let y: u32 = match i.next() {
        Some(num) => num.parse()?,
        None => x,
    };
    Ok((x, y))
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The number of optimization iterations. The default barely changes the
    /// content image, a few hundred iterations give a visible style.
    #[structopt(long, default_value = "1")]
    epochs: usize,
    /// The step size of the optimizer
    #[structopt(long, default_value = "0.004")]
    learning_rate: f64,
    /// The weight of the content loss, higher values preserve more of the
    /// content image's structure
    #[structopt(long, default_value = "8")]
    alpha: f32,
    /// The weight of the style loss, higher values transfer more of the
    /// style image's textures
    #[structopt(long, default_value = "70")]
    beta: f32,
    /// How often, in iterations, the current loss is logged
    #[structopt(long, default_value = "100")]
    report_every: usize,
    /// Aborts stylization of an image if it takes longer than this many seconds
    #[structopt(long)]
    time_limit: Option<u64>,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
}

impl Tweaks {
    fn apply<'a>(&self, sb: SessionBuilder<'a>) -> SessionBuilder<'a> {
        let sb = sb
            .epochs(self.epochs)
            .learning_rate(self.learning_rate)
            .content_weight(self.alpha)
            .style_weight(self.beta)
            .report_every(self.report_every);

        match self.time_limit {
            Some(secs) => sb.time_limit(Duration::from_secs(secs)),
            None => sb,
        }
    }

    fn progress(&self) -> Option<Box<dyn StylizeProgress>> {
        if self.no_progress {
            None
        } else {
            Some(Box::new(ProgressBarReporter::new()))
        }
    }
}

#[derive(StructOpt)]
struct ExtractStyle {
    /// The image from which the style will be sourced
    #[structopt(parse(from_os_str))]
    style: PathBuf,
    /// The path to save the style snapshot to
    #[structopt(parse(from_os_str))]
    snapshot: PathBuf,
}

#[derive(StructOpt)]
struct Stylize {
    /// The image whose structure is kept
    #[structopt(parse(from_os_str))]
    content: PathBuf,
    /// A style snapshot created with `extract-style`
    #[structopt(parse(from_os_str))]
    snapshot: PathBuf,
    /// The path to save the stylized image to, the file extension determines
    /// the image format used
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    #[structopt(flatten)]
    tweaks: Tweaks,
}

#[derive(StructOpt)]
struct StylizeDir {
    /// A directory of jpg and png images to stylize
    #[structopt(parse(from_os_str))]
    input_dir: PathBuf,
    /// A style snapshot created with `extract-style`
    #[structopt(parse(from_os_str))]
    snapshot: PathBuf,
    /// The directory to save the stylized images to, as `<name>.png`
    #[structopt(parse(from_os_str))]
    output_dir: PathBuf,
    #[structopt(flatten)]
    tweaks: Tweaks,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Extracts the style features of an image into a snapshot
    #[structopt(name = "extract-style")]
    ExtractStyle(ExtractStyle),
    /// Stylizes a content image with a style snapshot
    #[structopt(name = "stylize")]
    Stylize(Stylize),
    /// Stylizes every image in a directory with a style snapshot
    #[structopt(name = "stylize-dir")]
    StylizeDir(StylizeDir),
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of one image onto another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Path to the pretrained VGG19 weights, in safetensors format with
    /// torchvision's tensor names
    #[structopt(
        long,
        env = "NEURAL_STYLE_WEIGHTS",
        default_value = "vgg19.safetensors",
        parse(from_os_str)
    )]
    weights: PathBuf,
    /// The resolution images are processed at, in `width x height`, or a
    /// single number for both dimensions. A snapshot can only be used at the
    /// resolution it was extracted at.
    #[structopt(
        long,
        default_value = "512",
        parse(try_from_str = parse_size)
    )]
    size: (u32, u32),
    /// Runs on the GPU instead of the CPU
    #[cfg(feature = "wgpu")]
    #[structopt(long)]
    gpu: bool,
    /// Enables debug logging, overriding `RUST_LOG`
    #[structopt(short, long)]
    verbose: bool,
    #[structopt(subcommand)]
    cmd: Subcommand,
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn real_main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Opt::from_args();
    init_logging(args.verbose);

    #[cfg(feature = "wgpu")]
    {
        if args.gpu {
            use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
            return run::<Autodiff<Wgpu>>(&args, &WgpuDevice::default());
        }
    }

    run::<CpuBackend>(&args, &Default::default())
}

fn run<B: AutodiffBackend>(
    args: &Opt,
    device: &B::Device,
) -> Result<(), Box<dyn std::error::Error>> {
    let extractor = Vgg::<B>::from_safetensors(&args.weights, &ExtractorConfig::vgg19(), device)?;
    let resolution = Dims::new(args.size.0, args.size.1);

    match &args.cmd {
        Subcommand::ExtractStyle(es) => {
            neural_style::extract_style(&extractor, device, &es.style, resolution, &es.snapshot)?;
        }
        Subcommand::Stylize(st) => {
            let sb = Session::builder()
                .content(&st.content)
                .style_cache(&st.snapshot)
                .resolution(resolution);

            neural_style::stylize(
                &extractor,
                device,
                st.tweaks.apply(sb),
                &st.output,
                st.tweaks.progress(),
            )?;
        }
        Subcommand::StylizeDir(sd) => {
            let (stylized, failed) = stylize_dir(&extractor, device, sd, resolution)?;
            if failed > 0 {
                return Err(format!(
                    "{} of {} images could not be stylized",
                    failed,
                    stylized + failed
                )
                .into());
            }
        }
    }

    Ok(())
}

/// Maps `dir/name.ext` to `output_dir/name.png`
fn output_path(output_dir: &Path, input: &Path) -> Option<PathBuf> {
    let mut name = input.file_stem()?.to_os_string();
    name.push(".png");
    Some(output_dir.join(name))
}

/// Stylizes every image in a directory, returning the number of images that
/// were stylized and the number that failed
fn stylize_dir<B: AutodiffBackend>(
    extractor: &Vgg<B>,
    device: &B::Device,
    args: &StylizeDir,
    resolution: Dims,
) -> Result<(usize, usize), neural_style::Error> {
    let snapshot = StyleSnapshot::load(&args.snapshot)?;

    let mut inputs: Vec<PathBuf> = std::fs::read_dir(&args.input_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image_file(path))
        .collect();
    inputs.sort();

    tracing::info!(
        dir = %args.input_dir.display(),
        images = inputs.len(),
        "stylizing directory"
    );

    let (mut stylized, mut failed) = (0, 0);
    for input in &inputs {
        let output = match output_path(&args.output_dir, input) {
            Some(output) => output,
            None => continue,
        };

        let sb = Session::builder()
            .content(input)
            .style_snapshot(&snapshot)
            .resolution(resolution);

        match neural_style::stylize(
            extractor,
            device,
            args.tweaks.apply(sb),
            &output,
            args.tweaks.progress(),
        ) {
            Ok(()) => stylized += 1,
            Err(err) => {
                tracing::error!(input = %input.display(), error = %err, "failed to stylize");
                failed += 1;
            }
        }
    }

    Ok((stylized, failed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("512").unwrap(), (512, 512));
        assert_eq!(parse_size("640x480").unwrap(), (640, 480));
        assert!(parse_size("x480").is_err());
        assert!(parse_size("big").is_err());
    }

    #[test]
    fn directory_outputs_are_png() {
        assert_eq!(
            output_path(Path::new("out"), Path::new("in/photo.jpg")),
            Some(PathBuf::from("out/photo.png"))
        );
        assert_eq!(
            output_path(Path::new("out"), Path::new("in/my.holiday.jpeg")),
            Some(PathBuf::from("out/my.holiday.png"))
        );
    }

    #[test]
    fn parses_stylize_invocation() {
        let opt = Opt::from_iter_safe([
            "neural-style",
            "--size",
            "64",
            "stylize",
            "content.jpg",
            "style.snap",
            "out.png",
            "--epochs",
            "20",
            "--alpha",
            "1.5",
        ])
        .unwrap();

        assert_eq!(opt.size, (64, 64));
        match opt.cmd {
            Subcommand::Stylize(st) => {
                assert_eq!(st.output, PathBuf::from("out.png"));
                assert_eq!(st.tweaks.epochs, 20);
                assert!((st.tweaks.alpha - 1.5).abs() < f32::EPSILON);
                assert!((st.tweaks.beta - 70.0).abs() < f32::EPSILON);
            }
            _ => panic!("expected the stylize subcommand"),
        }
    }

    #[test]
    fn stylize_dir_continues_past_failures() {
        use neural_style::{image, Stage};
        use std::ffi::OsStr;

        let device = Default::default();
        let config = ExtractorConfig::new(
            vec![Stage::Conv(4), Stage::Pool, Stage::Conv(8)],
            vec![0, 3],
        );
        let vgg = Vgg::<CpuBackend>::seeded(&config, 5, &device).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("in");
        let output_dir = dir.path().join("out");
        std::fs::create_dir(&input_dir).unwrap();

        let checkers = image::RgbImage::from_fn(16, 16, |x, y| {
            if (x / 2 + y / 2) % 2 == 0 {
                image::Rgb([200, 30, 30])
            } else {
                image::Rgb([10, 10, 90])
            }
        });
        checkers.save(input_dir.join("good.jpg")).unwrap();
        std::fs::write(input_dir.join("broken.png"), b"not an image").unwrap();
        std::fs::write(input_dir.join("notes.txt"), b"ignored").unwrap();

        let snapshot = dir.path().join("style.snap");
        neural_style::extract_style(
            &vgg,
            &device,
            image::DynamicImage::ImageRgb8(checkers),
            Dims::square(16),
            &snapshot,
        )
        .unwrap();

        let opt = Opt::from_iter_safe([
            OsStr::new("neural-style"),
            OsStr::new("stylize-dir"),
            input_dir.as_os_str(),
            snapshot.as_os_str(),
            output_dir.as_os_str(),
            OsStr::new("--no-progress"),
        ])
        .unwrap();

        let args = match opt.cmd {
            Subcommand::StylizeDir(args) => args,
            _ => panic!("expected the stylize-dir subcommand"),
        };

        assert_eq!(
            stylize_dir(&vgg, &device, &args, Dims::square(16)).unwrap(),
            (1, 1)
        );
        assert!(output_dir.join("good.png").exists());
        assert!(!output_dir.join("broken.png").exists());
        assert!(!output_dir.join("notes.png").exists());
    }

    #[test]
    fn rejects_missing_arguments() {
        assert!(Opt::from_iter_safe(["neural-style", "extract-style", "style.jpg"]).is_err());
        assert!(Opt::from_iter_safe(["neural-style", "stylize", "a.jpg", "b.snap"]).is_err());
    }
}
