use dpwrap_engine::prelude::*;

pub mod prelude {
    pub use super::{Args, FleetArgs, VcpuSetArgs};
}

const DEFAULT_AFTER_HELP: &str = "Refer to the crate's documentation for further help";

#[derive(clap::Parser, Debug)]
#[command(after_help=DEFAULT_AFTER_HELP)]
pub struct Args {
    /// Quiet mode / Exit code as admission result
    ///
    /// When enabled, a zero exit code means the whole VCPU set was
    /// admitted, a one means at least one VCPU was rejected, any other
    /// code means that an error has happened.
    #[arg(short='q', default_value="false", action=clap::ArgAction::SetTrue)]
    pub quiet: bool,

    /// Scheduler log verbosity (repeat for more)
    #[arg(short='v', action=clap::ArgAction::Count)]
    pub verbose: u8,

    /// Simulated run length in milliseconds (0 = admission check only)
    #[arg(short='t', long="run-ms", value_name="MILLISECONDS", default_value="0")]
    pub run_ms: i64,

    #[command(flatten, next_help_heading="Fleet Specification")]
    pub fleet: FleetArgs,

    #[command(flatten, next_help_heading="VCPU Set Specification")]
    pub vcpu_set: VcpuSetArgs,
}

#[derive(clap::Args, Debug)]
pub struct FleetArgs {
    /// Number of PCPUs
    #[arg(short='n', value_name="# PCPUs", default_value="4")]
    pub num_pcpus: usize,

    /// Number of dom0 VCPUs (each pins one PCPU)
    #[arg(short='d', long="dom0", value_name="# VCPUs", default_value="1")]
    pub dom0_vcpus: usize,
}

#[derive(clap::Args, Debug)]
pub struct VcpuSetArgs {
    /// VCPU set data file
    #[arg(short='i', value_name="VCPU SET FILE")]
    pub vcpu_set_file: String,

    /// VCPU set file type
    #[arg(value_enum, short='f', long="format", value_name="FORMAT", default_value="auto")]
    pub vcpu_set_file_ty: VcpuSetFileType,
}
