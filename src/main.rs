use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use faceswap_pilot::{
    Config, PeopleLibrary, ReportFormat, RootLayout, RunOptions, RunOutcome, RunReport, SwapCore,
    format_duration, generate_report,
    progress::{ConsoleProgressReporter, JsonEventReporter, NoOpProgressReporter, ProgressReporter},
};

/// faceswap-pilot - drive a face swap web service over a library of faces
///
/// Every face of every selected person is swapped onto every pending source image
#[derive(Parser)]
#[command(name = "faceswap-pilot")]
#[command(about = "faceswap-pilot - batch face swaps through a browser")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Haobo Zhang")]
#[command(long_about = r#"
faceswap-pilot runs one browser worker per face image and feeds it every
pending image in SourceImages/. Results land in Temp/ and a source is moved to
SourceImages/Completed/ once every face of every selected person has a result.

Expected root layout:
  Faces/<person>/<face images>
  SourceImages/<source images>
"#)]
pub struct Args {
    /// Root directory holding Faces/ and SourceImages/
    #[arg(short, long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Person to run (repeatable)
    #[arg(short, long = "person", value_name = "NAME")]
    pub persons: Vec<String>,

    /// Run every person found under Faces/
    #[arg(long, conflicts_with = "persons")]
    pub all: bool,

    /// List persons and their face counts, then exit
    #[arg(long)]
    pub list: bool,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Use a predefined configuration profile
    #[arg(long, value_name = "PROFILE")]
    pub profile: Option<String>,

    /// WebDriver endpoint (chromedriver, geckodriver, ...)
    #[arg(long, value_name = "URL")]
    pub webdriver_url: Option<String>,

    /// Run browsers without a window
    #[arg(long)]
    pub headless: bool,

    /// Leave visible browser windows open when workers finish
    #[arg(long)]
    pub keep_browser_open: bool,

    /// Attempts per (face, source) before giving up
    #[arg(long, value_name = "NUM", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,

    /// JPEG quality for saved results (1-100)
    #[arg(short, long, value_name = "QUALITY", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: Option<u8>,

    /// Stop the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub max_runtime: Option<u64>,

    /// Seconds to wait after a stop before killing the run
    #[arg(long, value_name = "SECS")]
    pub stop_grace: Option<u64>,

    /// Write a run report into the root directory
    #[arg(long)]
    pub report: bool,

    /// Report output format
    #[arg(long, value_enum)]
    pub report_format: Option<ReportFormatArg>,

    /// Print every run event as a JSON line instead of a progress bar
    #[arg(long)]
    pub events_json: bool,

    /// Verbose output mode
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (results only)
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ReportFormatArg {
    Json,
    Csv,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(format: ReportFormatArg) -> Self {
        match format {
            ReportFormatArg::Json => ReportFormat::Json,
            ReportFormatArg::Csv => ReportFormat::Csv,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let options = build_options(&args)?;

    // Initialize logging
    if let Some(level) = options.log_level() {
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }
    if let Some(name) = &args.profile {
        log::info!("Using profile '{name}'");
    }

    if args.list {
        return list_persons(&options);
    }

    let core = SwapCore::new(options.clone());
    let reporter: Box<dyn ProgressReporter> = if args.events_json {
        Box::new(JsonEventReporter)
    } else if options.quiet {
        Box::new(NoOpProgressReporter)
    } else {
        Box::new(ConsoleProgressReporter::new())
    };

    let report = core.run_with_progress(reporter.as_ref())?;

    if options.generate_report {
        let path = generate_report(&report, options.report_format, &report.root_dir)?;
        if !options.quiet {
            println!("Report saved to: {}", path.display());
        }
    }

    if !options.quiet && !args.events_json {
        print_results_summary(&report);
    }

    Ok(())
}

/// Defaults, then the config file, then the profile, then flags.
fn build_options(args: &Args) -> Result<RunOptions> {
    let config = match &args.config {
        Some(path) => Some(Config::load(path)?),
        None => match Config::default_path().filter(|path| path.is_file()) {
            Some(path) => Some(Config::load(&path)?),
            None => None,
        },
    };

    let mut options = RunOptions::default();
    if let Some(config) = &config {
        options = options.apply_config(config);
    }

    if let Some(name) = &args.profile {
        let profile = config
            .as_ref()
            .and_then(|config| config.profile(name))
            .with_context(|| format!("Profile '{name}' is not defined in the config file"))?;
        options = options.apply_profile(profile);
    }

    if let Some(root) = &args.root {
        options.root_dir = Some(root.clone());
    }
    if !args.persons.is_empty() {
        options = options.with_persons(args.persons.clone());
    }
    if args.all {
        options = options.with_all_persons(true);
    }
    if let Some(url) = &args.webdriver_url {
        options = options.with_webdriver_url(url.clone());
    }
    if args.headless {
        options = options.with_headless(true);
    }
    if args.keep_browser_open {
        options = options.with_close_browser_on_finish(false);
    }
    if let Some(attempts) = args.max_attempts {
        options = options.with_max_attempts(attempts);
    }
    if let Some(quality) = args.quality {
        options = options.with_quality(quality);
    }
    if let Some(secs) = args.max_runtime {
        options = options.with_max_runtime(Duration::from_secs(secs));
    }
    if let Some(secs) = args.stop_grace {
        options = options.with_stop_grace(Duration::from_secs(secs));
    }
    if args.report {
        options.generate_report = true;
    }
    if let Some(format) = args.report_format.clone() {
        options.report_format = format.into();
    }
    if args.verbose {
        options.verbose = true;
        options.quiet = false;
    }
    if args.quiet {
        options.quiet = true;
        options.verbose = false;
    }

    Ok(options)
}

fn list_persons(options: &RunOptions) -> Result<()> {
    let Some(layout) = options.root_dir.as_deref().and_then(RootLayout::existing) else {
        bail!("Root directory is not set or does not exist");
    };

    let faces_dir = layout.faces_dir.clone();
    let mut library = PeopleLibrary::new(layout);
    let persons = library.persons(false)?;
    if persons.is_empty() {
        println!("No persons found in {}", faces_dir.display());
        return Ok(());
    }
    for person in persons {
        println!("{} ({} faces)", person.name, person.faces.len());
    }
    Ok(())
}

fn print_results_summary(report: &RunReport) {
    use humansize::{DECIMAL, format_size};

    let headline = match report.outcome {
        RunOutcome::Completed => "🎉 Run completed!",
        RunOutcome::Stopped => "⏹️ Run stopped",
        RunOutcome::Killed => "💀 Run killed",
    };
    println!("\n{headline}");
    println!("📊 Results Summary:");
    println!("  👤 Workers: {}", report.workers);
    println!("  🖼️ Sources: {}", report.sources);
    println!("  ✅ Swapped: {}", report.succeeded);
    if report.failed_attempts > 0 {
        println!(
            "  🔁 Failed attempts: {} ({} gave up)",
            report.failed_attempts, report.final_failures
        );
    }
    println!("  📦 Archived sources: {}", report.archived);
    println!(
        "  💾 Results: {} in {}",
        format_size(report.output_bytes, DECIMAL),
        report.staging_dir.display()
    );

    println!("\n⏱️ Performance:");
    println!("  🕐 Duration: {}", format_duration(report.duration));
    println!("  🚀 Speed: {:.1} swaps/min", report.tasks_per_minute());

    if !report.errors.is_empty() && report.errors.len() <= 5 {
        println!("\n❌ Errors:");
        for error in &report.errors {
            println!("  • {error}");
        }
    } else if report.errors.len() > 5 {
        println!("\n❌ {} errors occurred (use --report for full details)", report.errors.len());
    }
}
