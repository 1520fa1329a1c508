//! Build command implementation for the img CLI.
//!
//! Turns command-line flags into build options, runs the build behind a
//! spinner and prints a summary.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use img_core::builder::options::{parse_key_values, OutputKind, OutputSpec, SecretSpec, SshSpec};
use img_core::builder::platform::parse_platforms;
use img_core::builder::{BuildOptions, Builder, ExportedArtifact, ScriptSource};
use img_core::Config;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context directory; `-` reads the build script from stdin and uses an empty context
    pub context: PathBuf,

    /// Build script, relative to the current directory (default: <context>/Dockerfile); `-` reads stdin
    #[arg(short, long)]
    pub file: Option<String>,

    /// Build-time variables (KEY=VALUE, or KEY to take it from the environment)
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Secret available to RUN steps (id=<id>,src=<path>)
    #[arg(long)]
    pub secret: Vec<SecretSpec>,

    /// SSH agent socket or keys for RUN steps (id=<id>[,key=<path>] or <id>[=<path>])
    #[arg(long)]
    pub ssh: Vec<SshSpec>,

    /// Target platforms (os/arch[/variant]); repeatable and comma separated
    #[arg(long)]
    pub platform: Vec<String>,

    /// Image names to register (name[:tag])
    #[arg(short, long)]
    pub tag: Vec<String>,

    /// Labels for the final image (KEY=VALUE)
    #[arg(long)]
    pub label: Vec<String>,

    /// Output (type=<local|tar|oci|docker|image>[,dest=<path>][,name=<name>])
    #[arg(short, long)]
    pub output: Option<OutputSpec>,

    /// Stage to build instead of the last one
    #[arg(long)]
    pub target: Option<String>,

    /// Do not use the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Maximum concurrent steps per platform
    #[arg(long)]
    pub max_workers: Option<usize>,
}

/// Builds an image and exports it.
pub async fn build(mut config: Config, args: BuildArgs) -> Result<()> {
    if let Some(workers) = args.max_workers {
        anyhow::ensure!(workers > 0, "--max-workers must be at least 1");
        config.max_workers = workers;
    }

    let prepared = build_options(args, &mut std::io::stdin())?;
    let options = prepared.options;
    let quiet = options.output.kind == OutputKind::Tar && options.output.is_stdout();

    let builder = Builder::open(config).context("Failed to open build state")?;

    let spinner = if quiet { ProgressBar::hidden() } else { spinner() };
    spinner.set_message(format!("Building {}", options.context_path.display()));

    let result = builder.build(options).await;
    drop(prepared.scratch_context);
    spinner.finish_and_clear();
    let report = result.context("Build failed")?;

    if quiet {
        return Ok(());
    }

    let platforms: Vec<String> = report.results.iter().map(|r| r.platform.to_string()).collect();
    let layers: usize = report.results.iter().map(|r| r.stats.layer_count).sum();

    eprintln!("{}", "Build completed successfully!".green().bold());
    eprintln!();
    eprintln!("  Platforms:   {}", platforms.join(", ").cyan());
    eprintln!("  Layers:      {} ({} cached)", layers, report.cached_layers());
    eprintln!("  Steps run:   {}", report.executed_steps());
    eprintln!("  Duration:    {}", format_duration(report.duration_secs).yellow());
    eprintln!("  Output:      {}", describe(&report.artifact));

    Ok(())
}

/// Build options and the empty context that backs `img build -`.
struct PreparedBuild {
    options: BuildOptions,
    scratch_context: Option<TempDir>,
}

fn read_stdin_script(stdin: &mut dyn Read) -> Result<String> {
    let mut text = String::new();
    stdin.read_to_string(&mut text).context("Failed to read build script from stdin")?;
    Ok(text)
}

fn build_options(args: BuildArgs, stdin: &mut dyn Read) -> Result<PreparedBuild> {
    let (context_path, script, scratch_context) = if args.context.as_os_str() == "-" {
        anyhow::ensure!(args.file.is_none(), "--file cannot be combined with a build script on stdin");
        let script = ScriptSource::Inline(read_stdin_script(stdin)?);
        let dir = tempfile::Builder::new()
            .prefix("img-context-")
            .tempdir()
            .context("Failed to create an empty build context")?;
        (dir.path().to_path_buf(), script, Some(dir))
    } else {
        if !args.context.is_dir() {
            anyhow::bail!("Build context not found: {}", args.context.display());
        }
        let script = match args.file.as_deref() {
            None => ScriptSource::ContextDefault,
            Some("-") => ScriptSource::Inline(read_stdin_script(stdin)?),
            Some(file) => {
                let cwd = std::env::current_dir().context("Failed to resolve the current directory")?;
                ScriptSource::File(cwd.join(file))
            }
        };
        (args.context, script, None)
    };

    let build_args = parse_key_values("--build-arg", &args.build_args, |key| std::env::var(key).ok())?;
    let labels = parse_key_values("--label", &args.label, |_| None)?;
    let platforms = parse_platforms(args.platform.as_slice())?;
    let output = merge_tags(args.output, args.tag);

    let options = BuildOptions {
        context_path,
        script,
        build_args,
        target: args.target,
        platforms,
        secrets: args.secret,
        ssh: args.ssh,
        labels,
        output,
        no_cache: args.no_cache,
    };
    Ok(PreparedBuild { options, scratch_context })
}

/// Adds `-t` names to sinks that take names. Without `-o` the image is
/// registered in the local store.
fn merge_tags(output: Option<OutputSpec>, tags: Vec<String>) -> OutputSpec {
    match output {
        None => OutputSpec::image(tags),
        Some(mut spec) => {
            if matches!(spec.kind, OutputKind::Image | OutputKind::Oci | OutputKind::Docker) {
                for tag in tags {
                    if !spec.names.contains(&tag) {
                        spec.names.push(tag);
                    }
                }
            }
            spec
        }
    }
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn describe(artifact: &ExportedArtifact) -> String {
    match artifact {
        ExportedArtifact::Images { references, digest } => {
            format!("{} {}", references.join(", ").green(), short_digest(digest).cyan())
        }
        other => other.to_string().yellow().to_string(),
    }
}

/// First 12 hex characters of a digest.
fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hex[..hex.len().min(12)]
}

/// Formats a duration in seconds to a human-readable string.
fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs - (mins * 60.0);
        format!("{:.0}m{:.0}s", mins, remaining_secs)
    }
}
