use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let device = Default::default();

    // torchvision's pretrained VGG19, exported to safetensors
    let extractor = ns::Vgg::<ns::CpuBackend>::from_safetensors(
        "vgg19.safetensors",
        &ns::ExtractorConfig::vgg19(),
        &device,
    )?;

    // the style only needs to be extracted once, the snapshot can be reused
    // for any number of content images at the same resolution
    let snapshot = ns::extract_style(
        &extractor,
        &device,
        &"imgs/starry_night.jpg",
        ns::Dims::square(256),
        "out/starry_night.snap",
    )?;

    let session = ns::Session::builder()
        .content(&"imgs/tom.jpg")
        .style_snapshot(&snapshot)
        .resolution(ns::Dims::square(256))
        // the default of a single iteration is only useful for smoke testing
        .epochs(300)
        .report_every(50)
        .build(&extractor, &device)?;

    let stylized = session.run(Some(Box::new(|update: ns::ProgressUpdate| {
        if update.iteration + 1 == update.total {
            println!("final loss: {}", update.loss);
        }
    })))?;

    stylized.save("out/01.png")
}
