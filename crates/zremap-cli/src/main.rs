//! Command-line interface for zremap.
//!
//! Remaps an IPA or unpacked app bundle onto a new developer team and
//! optionally hands each component to an external signing command.

use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use zremap::macho::{BuildVersionTarget, Platform};
use zremap::mapping::ProfileKind;
use zremap::orchestrator::InjectScope;
use zremap::services::{
    AssumeRegistered, ExternalSigner, PlanOnlySigner, RegistrationService, SigningService, StaticRegistration,
};
use zremap::{SigningPlan, ZRemap};

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    All,
    Main,
}

#[derive(Parser)]
#[command(name = "zremap")]
#[command(about = "Remap an iOS app's identities onto a new developer team")]
struct Cli {
    /// Input file (IPA or app bundle)
    input: PathBuf,

    /// Output IPA (IPA input only; defaults to <input>-remapped.ipa)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// New team ID
    #[arg(short, long)]
    team_id: String,

    /// JSON file listing identifiers confirmed on the new team
    #[arg(long, conflicts_with = "assume_registered")]
    registered: Option<PathBuf>,

    /// Treat every identifier as registered
    #[arg(long)]
    assume_registered: bool,

    /// Signing command with {binary} and {entitlements} placeholders
    #[arg(long)]
    sign_command: Option<String>,

    /// Keep identifiers that match no known prefix
    #[arg(long)]
    no_randomize: bool,

    /// Keep the original main bundle ID
    #[arg(long)]
    preserve_bundle_id: bool,

    /// Do not literal-patch binaries and plists
    #[arg(long)]
    no_patch: bool,

    /// Add get-task-allow
    #[arg(long)]
    allow_debugging: bool,

    /// Profile kind (development or adhoc)
    #[arg(long, default_value = "development")]
    profile: ProfileKind,

    /// Dylib to inject (repeatable)
    #[arg(long = "inject")]
    inject: Vec<PathBuf>,

    /// Which binaries injected dylibs are linked into
    #[arg(long, value_enum, default_value = "all")]
    inject_scope: Scope,

    /// Load path fragment to remove before injecting (repeatable)
    #[arg(long = "remove-dylib")]
    remove_dylib: Vec<String>,

    /// Force LC_BUILD_VERSION as <platform>:<minos>:<sdk>, e.g. ios:14.0:17.2
    #[arg(long)]
    build_version: Option<String>,

    /// Write the remapping manifest into the bundle
    #[arg(long)]
    manifest: bool,

    /// Capability metadata JSON
    #[arg(long)]
    capabilities: Option<PathBuf>,

    /// ZIP compression level (0-9, default: 6)
    #[arg(short = 'z', long, default_value = "6")]
    zip_level: u32,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let remap = build(&cli)?;
    let mut registration = registration(&cli)?;
    let mut signer = signer(&cli)?;

    let ext = cli
        .input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let plan = match ext.as_str() {
        "ipa" => {
            let output = cli.output.clone().unwrap_or_else(|| {
                let stem = cli.input.file_stem().unwrap_or_default().to_string_lossy();
                cli.input.with_file_name(format!("{stem}-remapped.ipa"))
            });
            let plan = remap.remap_ipa(&cli.input, &output, registration.as_mut(), signer.as_mut())?;
            println!("Remapped: {}", output.display());
            plan
        }
        _ => {
            let plan = remap.remap_bundle(&cli.input, registration.as_mut(), signer.as_mut())?;
            println!("Remapped: {}", cli.input.display());
            plan
        }
    };

    print_summary(&plan);
    Ok(())
}

fn build(cli: &Cli) -> Result<ZRemap, Box<dyn std::error::Error>> {
    let mut remap = ZRemap::new(&cli.team_id)
        .randomize_ids(!cli.no_randomize)
        .preserve_main_bundle_id(cli.preserve_bundle_id)
        .patch_ids(!cli.no_patch)
        .allow_debugging(cli.allow_debugging)
        .profile_kind(cli.profile)
        .manifest(cli.manifest)
        .compression_level(cli.zip_level);

    let scope = match cli.inject_scope {
        Scope::All => InjectScope::AllBinaries,
        Scope::Main => InjectScope::MainBinary,
    };
    for asset in &cli.inject {
        remap = remap.inject_dylib_with_scope(asset, scope);
    }
    for fragment in &cli.remove_dylib {
        remap = remap.conflicting_dylib(fragment);
    }
    if let Some(spec) = &cli.build_version {
        remap = remap.build_version(parse_build_version(spec)?);
    }
    if let Some(path) = &cli.capabilities {
        remap = remap.capabilities(path);
    }
    Ok(remap)
}

fn parse_build_version(spec: &str) -> Result<BuildVersionTarget, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [platform, minos, sdk] = parts.as_slice() else {
        return Err(format!("invalid --build-version '{spec}', expected <platform>:<minos>:<sdk>").into());
    };
    let platform: Platform = platform.parse()?;
    Ok(BuildVersionTarget::new(platform, minos, sdk)?)
}

fn registration(cli: &Cli) -> Result<Box<dyn RegistrationService>, Box<dyn std::error::Error>> {
    if let Some(path) = &cli.registered {
        return Ok(Box::new(StaticRegistration::from_file(path)?));
    }
    if !cli.assume_registered {
        info!("no --registered file; only team IDs will be patched into binaries");
        return Ok(Box::new(StaticRegistration::default()));
    }
    Ok(Box::new(AssumeRegistered))
}

fn signer(cli: &Cli) -> Result<Box<dyn SigningService>, Box<dyn std::error::Error>> {
    match &cli.sign_command {
        Some(template) => Ok(Box::new(ExternalSigner::new(template)?)),
        None => Ok(Box::new(PlanOnlySigner)),
    }
}

fn print_summary(plan: &SigningPlan) {
    for step in &plan.steps {
        let entitlements = step
            .entitlements
            .as_ref()
            .map(|p| format!(" [{}]", p.display()))
            .unwrap_or_default();
        println!(
            "  {:<40} {} ({} replacements){}",
            step.component.bundle_id, step.bundle_id, step.replacements, entitlements
        );
    }
    println!(
        "{} mappings, {} confirmed, {} patch entries",
        plan.mappings.len(),
        plan.registered.len(),
        plan.patch_set.len()
    );
}
