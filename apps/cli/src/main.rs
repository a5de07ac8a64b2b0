use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use fwup_core::{NusbBus, Registry, TargetKind, TargetOptions};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware uploader for USB bootloaders", long_about = None)]
struct Args {
    /// Firmware image to program
    file: Option<PathBuf>,

    /// Bootloader family (see --list-targets)
    #[arg(short, long)]
    target: Option<String>,

    /// Vendor/product ID of the target device, in hex
    #[arg(short, long, value_name = "VID:PID", value_parser = parse_device)]
    device: Option<(u16, u16)>,

    /// Which of several matching devices to use
    #[arg(long)]
    index: Option<usize>,

    /// TOML file with connection options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging and print target details
    #[arg(short, long)]
    verbose: bool,

    /// Only report warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Don't start the program after uploading it
    #[arg(long, conflicts_with = "run_only")]
    no_run: bool,

    /// Start the program already on the device without uploading anything
    #[arg(long)]
    run_only: bool,

    /// Erase the device without uploading a new program
    #[arg(short = 'E', long, conflicts_with = "run_only")]
    erase_only: bool,

    /// Print the target's identification and exit
    #[arg(short = 'I', long)]
    info: bool,

    /// Skip the extra per-page delay on Micronucleus boards
    #[arg(long)]
    fast: bool,

    /// Fail right away when no device is connected
    #[arg(long)]
    no_wait: bool,

    /// List supported bootloader families and exit
    #[arg(long)]
    list_targets: bool,
}

fn parse_device(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got '{s}'"))?;
    let parse = |v: &str| {
        u16::from_str_radix(v.trim_start_matches("0x"), 16)
            .map_err(|e| format!("invalid ID '{v}': {e}"))
    };
    Ok((parse(vid)?, parse(pid)?))
}

/// Family implied by the name the binary was invoked as, e.g. `microprog`.
fn utility_name() -> Option<String> {
    let argv0 = std::env::args_os().next()?;
    Path::new(&argv0)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

fn resolve_kind<'r>(
    registry: &'r Registry<NusbBus>,
    args: &Args,
) -> anyhow::Result<&'r TargetKind<NusbBus>> {
    if let Some(kind) = utility_name().and_then(|name| registry.by_utility_name(&name)) {
        return Ok(kind);
    }
    let name = args.target.as_deref().unwrap_or("dfu");
    registry.by_target_name(name).with_context(|| {
        format!("unknown target '{name}'; use --list-targets to see the supported ones")
    })
}

fn load_options(args: &Args) -> anyhow::Result<TargetOptions> {
    let mut options = match &args.config {
        Some(path) => TargetOptions::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TargetOptions::default(),
    };

    if let Some((vid, pid)) = args.device {
        options.selector.vendor_id = Some(vid);
        options.selector.product_id = Some(pid);
    }
    if let Some(index) = args.index {
        options.selector.index = index;
    }
    if args.fast {
        options.fast_mode = true;
    }
    if args.no_wait {
        options.wait = false;
    }
    Ok(options)
}

fn run(args: &Args) -> anyhow::Result<()> {
    let registry = Registry::<NusbBus>::builtin();

    if args.list_targets {
        for kind in registry.kinds() {
            println!(
                "{:<14} {:<12} {}",
                kind.target_name, kind.utility_name, kind.description
            );
        }
        return Ok(());
    }

    let kind = resolve_kind(&registry, args)?;
    let options = load_options(args)?;
    let programming = !(args.erase_only || args.run_only || args.info);

    let image = if programming {
        let Some(path) = &args.file else {
            bail!("no firmware file given (or use --erase-only, --run-only or --info)");
        };
        Some(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?)
    } else {
        None
    };

    kind.print_preconnect_info(&mut |line| info!("{}", line));

    let mut target = kind
        .connect(NusbBus, &options)
        .with_context(|| format!("could not find a {} board", kind.target_name))?;
    info!("Target found!");

    if args.verbose || args.info {
        target.print_target_info(&mut |line| info!("{}", line));
    }
    if args.info {
        return Ok(());
    }

    if let Some(image) = &image {
        let total = target.size_to_program(image)?;
        info!("Programming {} bytes...", image.len());

        let mut last_reported = None;
        target.program(image, &mut |done, total| {
            let percent = done * 100 / total.max(1);
            if last_reported != Some(percent / 10) {
                last_reported = Some(percent / 10);
                info!("Programming: {:>3}% ({}/{} bytes)", percent, done, total);
            }
        })?;
        info!(bytes = total, "Programming complete!");
    }

    if args.erase_only {
        info!("Erasing board...");
        target.erase()?;
    }

    if args.run_only || (programming && !args.no_run) {
        info!("Running newly-programmed application.");
        target.run_user_program()?;
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else if args.quiet {
                    tracing::Level::WARN.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("16d0:0753"), Ok((0x16d0, 0x0753)));
        assert_eq!(parse_device("0x1fc9:0x000c"), Ok((0x1fc9, 0x000c)));
        assert!(parse_device("16d0").is_err());
        assert!(parse_device("xyz:0753").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "fwup",
            "--device",
            "04b4:00f3",
            "--index",
            "2",
            "--no-wait",
            "--fast",
        ]);
        let options = load_options(&args).unwrap();
        assert_eq!(options.selector.vendor_id, Some(0x04b4));
        assert_eq!(options.selector.product_id, Some(0x00f3));
        assert_eq!(options.selector.index, 2);
        assert!(!options.wait);
        assert!(options.fast_mode);
    }

    #[test]
    fn test_target_flag_selects_family() {
        let registry = Registry::<NusbBus>::builtin();
        let args = Args::parse_from(["fwup", "--target", "fx3", "image.img"]);
        // The test binary's own name is not a utility name.
        assert_eq!(resolve_kind(&registry, &args).unwrap().target_name, "fx3");

        let args = Args::parse_from(["fwup", "--target", "avr"]);
        assert!(resolve_kind(&registry, &args).is_err());
    }

    #[test]
    fn test_conflicting_run_flags_rejected() {
        assert!(Args::try_parse_from(["fwup", "--run-only", "--no-run"]).is_err());
    }
}
