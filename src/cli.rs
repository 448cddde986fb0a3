use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "petrel",
    version,
    about = "Kubernetes desktop client core, driven from the command line."
)]
pub struct CliArgs {
    /// Saved cluster name from the preferences file
    #[arg(long)]
    pub cluster: Option<String>,

    /// Kubeconfig file to connect with
    #[arg(long, conflicts_with = "in_cluster")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    pub context: Option<String>,

    /// Use the service account of the pod we run in
    #[arg(long)]
    pub in_cluster: bool,

    /// Resource to list, by plural, kind or short name (pods, ing, deploy)
    #[arg(short, long)]
    pub resource: Option<String>,

    /// Search text applied to the listed objects (supports ns:<name>)
    #[arg(short, long, requires = "resource")]
    pub search: Option<String>,

    /// Print extension details below every listed object
    #[arg(long, requires = "resource")]
    pub details: bool,

    /// YAML file to create or update on the cluster
    #[arg(long, conflicts_with = "resource")]
    pub apply: Option<PathBuf>,

    /// Apply updates without asking for confirmation
    #[arg(short, long, requires = "apply")]
    pub yes: bool,

    /// Keep printing updates of the listed resource for this many seconds
    #[arg(long, default_value_t = 0)]
    pub watch_secs: u64,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
