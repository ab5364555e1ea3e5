//! Logging setup shared by the kiln binaries.
//!
//! Everything is written to stderr through [tracing_subscriber], filtered by
//! `RUST_LOG` or the configured level. Spans carrying an `indicatif.pb_show`
//! field are additionally rendered as progress bars, if enabled.
use indicatif::ProgressStyle;
use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, writer, IndicatifLayer, IndicatifWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    pub static ref PB_SPINNER_STYLE: ProgressStyle = ProgressStyle::with_template(
        "{span_child_prefix}{spinner} {wide_msg} ({elapsed})"
    )
    .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),
}

/// Returned by [TracingBuilder::build], gives access to writers that don't
/// clobber active progress bars.
#[derive(Clone)]
pub struct TracingHandle {
    stdout_writer: IndicatifWriter<writer::Stdout>,
    stderr_writer: IndicatifWriter<writer::Stderr>,
}

impl TracingHandle {
    /// Instead of `println!(...)` prefer `writeln!(handle.get_stdout_writer(), ...)`.
    pub fn get_stdout_writer(&self) -> IndicatifWriter<writer::Stdout> {
        // only a wrapper over an `Arc`
        self.stdout_writer.clone()
    }

    /// Instead of `eprintln!(...)` prefer `writeln!(handle.get_stderr_writer(), ...)`.
    pub fn get_stderr_writer(&self) -> IndicatifWriter<writer::Stderr> {
        self.stderr_writer.clone()
    }
}

pub struct TracingBuilder {
    level: Level,
    progress_bar: bool,
    ansi: bool,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
            progress_bar: false,
            ansi: true,
        }
    }
}

impl TracingBuilder {
    /// Sets the default log level. RUST_LOG takes priority over it.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Enables the progress bar layer, off by default.
    pub fn enable_progressbar(mut self) -> TracingBuilder {
        self.progress_bar = true;
        self
    }

    /// Disables colored output, e.g. when logging to a file.
    pub fn disable_ansi(mut self) -> TracingBuilder {
        self.ansi = false;
        self
    }

    /// Installs the global subscriber. Fails if one is already set.
    pub fn build(self) -> Result<TracingHandle, Error> {
        let indicatif_layer = IndicatifLayer::new().with_progress_style(PB_SPINNER_STYLE.clone());
        let stdout_writer = indicatif_layer.get_stdout_writer();
        let stderr_writer = indicatif_layer.get_stderr_writer();

        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_ansi(self.ansi)
                    .compact(),
            )
            .with(self.progress_bar.then(|| {
                // only spans with the indicatif.pb_show field get a bar.
                indicatif_layer.with_filter(IndicatifFilter::new(false))
            }))
            .try_init()?;

        Ok(TracingHandle {
            stdout_writer,
            stderr_writer,
        })
    }
}
