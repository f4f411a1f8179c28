//! Nested virtualization webhook - enables VT-x/AMD-V on matching KubeVirt VMs

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nested_virt_webhook::config::{Overrides, Settings};
use nested_virt_webhook::detect::CpuFeature;
use nested_virt_webhook::{scheme, startup};

/// Mutating admission webhook that injects the host's virtualization CPU
/// feature into KubeVirt VirtualMachines matching per-namespace name patterns
#[derive(Parser, Debug)]
#[command(name = "nested-virt-webhook", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML settings file
    #[arg(short = 'c', long, env = "NESTED_VIRT_CONFIG")]
    config: Option<PathBuf>,

    /// HTTPS listen port
    #[arg(long, env = "NESTED_VIRT_PORT")]
    port: Option<u16>,

    /// Directory containing tls.crt and tls.key
    #[arg(long, env = "NESTED_VIRT_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Certificate file, overrides --cert-dir
    #[arg(long, env = "NESTED_VIRT_CERT_FILE")]
    cert_file: Option<PathBuf>,

    /// Private key file, overrides --cert-dir
    #[arg(long, env = "NESTED_VIRT_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, env = "NESTED_VIRT_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "NESTED_VIRT_LOG_JSON")]
    log_json: bool,

    /// File the CPU feature detector reads
    #[arg(long, env = "NESTED_VIRT_CPUINFO_PATH")]
    cpuinfo_path: Option<PathBuf>,

    /// Inject this feature (vmx or svm) instead of reading the host
    #[arg(long, env = "NESTED_VIRT_CPU_FEATURE")]
    cpu_feature: Option<CpuFeature>,

    /// ConfigMap holding namespace -> comma-separated pattern rules
    /// (default: nested-virt-config)
    #[arg(long, env = "NESTED_VIRT_CONFIGMAP_NAME")]
    configmap_name: Option<String>,

    /// Namespace of the rules ConfigMap (default: default)
    #[arg(long, env = "NESTED_VIRT_CONFIGMAP_NAMESPACE")]
    configmap_namespace: Option<String>,

    /// Use only file rules and never contact the API server
    #[arg(long, env = "NESTED_VIRT_DISABLE_CONFIGMAP")]
    disable_configmap: bool,

    /// Kubeconfig used to read the rules ConfigMap (default: in-cluster)
    #[arg(long, env = "NESTED_VIRT_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            cert_dir: self.cert_dir.clone(),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            debug: self.debug,
            log_json: self.log_json,
            cpuinfo_path: self.cpuinfo_path.clone(),
            cpu_feature: self.cpu_feature,
            configmap_name: self.configmap_name.clone(),
            configmap_namespace: self.configmap_namespace.clone(),
            disable_configmap: self.disable_configmap,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let settings = startup::load_settings(cli.config.as_deref(), &cli.overrides())?;

    init_tracing(&settings);

    // Built before the listener starts; handlers only read it
    let registry = scheme::registry();
    tracing::debug!(kinds = registry.len(), "Scheme registry initialized");

    let rules = startup::load_rules(&settings, cli.kubeconfig.as_deref()).await?;
    startup::run(&settings, rules).await?;

    tracing::info!("Nested virtualization webhook shutting down");
    Ok(())
}

/// RUST_LOG wins; otherwise `info`, or `debug` with the debug setting
fn init_tracing(settings: &Settings) {
    let default_level = if settings.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},hyper=warn,tower=warn")));

    let (plain, json) = if settings.log_json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .init();
}
