use console::style;
use indicatif::ProgressStyle;

/// Installs a `tracing` subscriber printing logs above the progress bars.
/// The filter defaults to `info` and can be overridden with `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // already initialized is fine
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init();
}

pub(crate) fn get_style_task() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    ProgressStyle::with_template("{spinner:.green} {msg}")
}

pub(crate) fn get_style_steps() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    Ok(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?
    .progress_chars("=>-"))
}

/// Renders an error and its chain of causes for the terminal.
pub fn report(error: &anyhow::Error) -> String {
    let mut chain = error.chain();
    let mut out = match chain.next() {
        Some(head) => format!("{} {}", style("error:").red().bold(), head),
        None => String::new(),
    };

    for cause in chain {
        out.push_str(&format!("\n  {} {}", style("caused by:").yellow(), cause));
    }

    out
}
